//! Error types for invite envelopes, the connection manager, and the dispatcher.

use thiserror::Error;

/// Result type alias using [`EnvelopeError`].
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Envelope errors (C3). All three variants are `InvalidInput` in the overall
/// error design: a bad invite code is always surfaced to the caller that
/// tried to redeem it, never silently dropped, since the caller is the one
/// person who can ask the inviter to resend it.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invite text is not validly formatted: {0}")]
    InvalidFormat(String),
    #[error("invite signature tag does not match the group key")]
    InvalidSignature,
    #[error("invite payload did not decode to the expected shape: {0}")]
    InvalidPayload(String),
    #[error("core crypto error: {0}")]
    Core(#[from] weftmesh_core::Error),
}

/// Dispatcher errors (C5). The dispatcher's own contract is to never
/// propagate a fault for untrusted peer input — these variants exist for the
/// handful of cases a caller needs to observe (e.g. to log), not because the
/// message loop should stop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message body failed to parse as JSON: {0}")]
    Malformed(String),
    #[error("unknown control message type: {0}")]
    UnknownType(String),
}
