//! Error types for the update pipeline.

use index_sync_stream::StreamError;
use index_sync_types::ExternalError;
use thiserror::Error;

/// Errors that can occur in the update pipeline
#[derive(Debug, Error)]
pub enum UpdaterError {
    /// No update mapper registered under this name
    #[error("Unknown update mapper: {0}")]
    UnknownMapper(String),

    /// Updater settings failed validation
    #[error("Invalid updater settings: {0}")]
    InvalidSettings(String),

    /// A whole bulk write failed; the pipeline restarts at the next batch
    #[error("Bulk write of {ops} operations failed: {source}")]
    BulkWrite {
        ops: usize,
        #[source]
        source: ExternalError,
    },

    /// Restart cap exceeded
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}
