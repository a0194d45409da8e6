//! Error types for the overlay relay.

use thiserror::Error;

/// Result type alias using [`OverlayError`].
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Overlay relay errors.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// `Transient`: the UDP socket could not be bound or a send failed.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `InvalidInput`: a group id not on this relay's allow-list was presented.
    #[error("group {0} is not served by this relay")]
    GroupNotAllowed(String),
}
