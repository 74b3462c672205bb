//! Error types for flowlog-store

use thiserror::Error;

/// Event log storage error type
#[derive(Debug, Error)]
pub enum Error {
    /// A payload, asset key, or event draft could not be encoded or decoded.
    /// This is a caller defect and is never retried by the store.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backing medium could not be reached, or a retry budget was
    /// exhausted. Callers may retry with backoff or surface to the operator.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The storage configuration is invalid or incomplete.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
