//! Error types for the signed phonebook.

use thiserror::Error;

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Phonebook errors.
///
/// All variants here map to `InvalidSignature` or `InvalidInput` in the
/// overall error design — a rejected entry or tombstone is always a silent
/// drop at the call site, never a caller-visible fault; see each call site's
/// log statement for the observable side effect.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("entry expired")]
    Expired,
    #[error("peer is revoked by a live tombstone")]
    Revoked,
    #[error("sequence/timestamp/signature does not supersede the stored entry")]
    StaleWrite,
    #[error("core crypto error: {0}")]
    Core(#[from] weftmesh_core::Error),
}
