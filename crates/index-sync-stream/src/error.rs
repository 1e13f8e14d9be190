//! Error types for supervised streams.

use thiserror::Error;

/// Errors surfaced by supervised streams and tasks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The restart cap was exceeded; the caller has to escalate
    #[error("{name} gave up after {failures} consecutive failures: {last_error}")]
    Exhausted {
        name: String,
        failures: u32,
        last_error: String,
    },
}
