//! Error types for the content store and its cache.

use thiserror::Error;

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Content store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `InvalidInput`: a manifest or blob referenced by a caller does not exist.
    #[error("no manifest for peer {0}")]
    NoSuchManifest(String),

    /// `StorageCorruption`: a manifest names a hash with no corresponding blob
    /// on disk. The package operation that hit this fails; callers should
    /// expect a later maintenance sweep to record and reconcile the orphan.
    #[error("missing blob for hash {0} referenced by manifest {1}")]
    MissingBlob(String, String),

    /// `Fatal`: disk I/O failed while writing or renaming a blob.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `Fatal`: a ref table or manifest on disk did not parse as JSON.
    #[error("storage data corrupted: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cache errors. Per §4.8, cache failures never propagate to callers; this
/// type exists for completeness and internal logging, not for callers to
/// match on.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),
}
