//! Error types for roster state.

use thiserror::Error;

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Roster errors. All variants are `InvalidInput` in the overall design: a
/// caller asked for a group or member that does not exist.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no roster for group {0}")]
    NoSuchRoster(String),
    #[error("no member {0} in group {1}")]
    NoSuchMember(String, String),
}
