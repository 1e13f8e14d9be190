//! Background reconciliation of the search index.
//!
//! Sweeps the authoritative store and the index in key order, compares the
//! two scans and requests re-indexing wherever they disagree.
//!
//! ## Key Components
//!
//! - [`Reconciler`]: merge-comparison of two key-ordered metadata streams
//! - [`BackgroundSync`]: long-running actor driving reconciliation passes,
//!   persisting the resumption [`Bookmark`](index_sync_types::Bookmark) and
//!   reporting health
//! - [`BookmarkStore`]: persistence of the bookmark, in memory or as a JSON file
//!
//! ## Passes
//!
//! A pass starts from the last persisted bookmark. While it runs, the
//! furthest key fully compared on each side is tracked; every quiet period
//! the smaller of the two is persisted, so an interrupted pass resumes from
//! a point both sides have provably passed. A completed pass resets the
//! bookmark so that the next one sweeps the whole key space.

pub mod background;
pub mod bookmark_store;
pub mod error;
mod pass;
pub mod progress;
pub mod reconciler;
pub mod source;
pub mod status;

pub use background::{BackgroundSync, BackgroundSyncHandle, SyncCollaborators};
pub use bookmark_store::{InMemoryBookmarkStore, JsonFileBookmarkStore};
pub use error::ReconcileError;
pub use progress::ProgressReport;
pub use reconciler::{ReconcileEvent, Reconciler, Side};
pub use source::{BookmarkStore, MetadataSource};
pub use status::{EventHistory, EventKind, HealthLevel, StatusEvent, SyncState, SyncStatus};
