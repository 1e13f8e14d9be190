//! Error types for background reconciliation.

use index_sync_stream::StreamError;
use index_sync_types::TypesError;
use thiserror::Error;

/// Errors that can occur during reconciliation
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding error
    #[error("Types error: {0}")]
    Types(#[from] TypesError),

    /// A source exhausted its restarts
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// The background sync actor has shut down
    #[error("Background sync is not running")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReconcileError::Stream(StreamError::Exhausted {
            name: "indexed".to_string(),
            failures: 4,
            last_error: "Timed out: scan".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Stream error: indexed gave up after 4 consecutive failures: Timed out: scan"
        );
        assert_eq!(ReconcileError::Stopped.to_string(), "Background sync is not running");
    }
}
