//! Error types shared across the index-sync crates.

use thiserror::Error;

/// Errors raised while constructing or decoding domain types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed entity key
    #[error("Invalid entity key: {0}")]
    InvalidKey(String),
}

/// Failure reported by an external collaborator (store, index driver,
/// enforcement, blocklist, bookmark store).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalError {
    /// The collaborator could not be reached or is temporarily failing
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The collaborator did not answer in time
    #[error("Timed out: {0}")]
    Timeout(String),
}
