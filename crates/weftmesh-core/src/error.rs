//! Error types shared by weftmesh-core.

use thiserror::Error;

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// weftmesh-core error type.
///
/// Maps onto the error kinds of the overall design as follows: `InvalidName`
/// and `InvalidPublicKey` are `InvalidInput`; `InvalidSignature` is
/// `InvalidSignature`; `Json` is `Fatal` (it can only happen on a
/// programmer error, never on untrusted peer input, since all payloads
/// passing through here have already round-tripped through `serde_json`).
#[derive(Debug, Error)]
pub enum Error {
    /// Canonical JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A group or display name failed the character whitelist.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// A public key did not decode to a valid Ed25519 point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A MAC tag did not match under constant-time comparison.
    #[error("invalid mac")]
    InvalidMac,
}
