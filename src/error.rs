//! Cache Error Types
//!
//! Structured error handling for the tiered cache.
//! Most variants never leave the crate: tier-internal failures are logged and
//! converted into misses at the orchestrator boundary.

/// Cache error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid key: keys must be non-empty")]
    InvalidKey,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No resolver configured")]
    ResolverUnavailable,

    #[error("Record for '{key}' is corrupt: {reason}")]
    RecordCorrupt { key: String, reason: String },

    #[error("Persistent index is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;

/// Reject empty keys before they reach any tier
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey);
    }
    Ok(())
}
