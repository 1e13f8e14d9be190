//! Failure-tolerant streaming primitives.
//!
//! - [`RestartTracker`]: capped exponential backoff with jitter, a restart
//!   cap and a recovery period that resets the failure count
//! - [`resume_with_backoff`]: reopens a key-ordered source after the last
//!   delivered key whenever it fails
//! - [`supervise`]: reruns a fallible task with backoff until it completes,
//!   is cancelled or exhausts its restarts
//!
//! # Example
//!
//! ```ignore
//! use index_sync_stream::resume_with_backoff;
//!
//! let metadata = resume_with_backoff(
//!     "persisted",
//!     bookmark.start_after(),
//!     settings.background_sync.backoff.clone(),
//!     cancel.clone(),
//!     move |after| store.scan_ordered(after),
//! );
//! ```

mod error;
mod restart;
mod resume;
mod supervise;

pub use error::StreamError;
pub use restart::RestartTracker;
pub use resume::{resume_with_backoff, Keyed};
pub use supervise::supervise;
