//! # index-sync-types
//!
//! Shared domain types for keeping a search index consistent with the
//! authoritative entity store.
//!
//! - [`EntityKey`]: totally ordered, namespace-qualified entity identifier
//! - [`Metadata`]: change notification / reconciliation record for one entity
//! - [`WriteModel`]: desired index representation of an entity
//! - [`IncrementalUpdateOp`]: minimal index mutation derived from two write models
//! - [`Bookmark`]: persisted resumption point of a reconciliation pass
//! - [`Settings`]: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use index_sync_types::{EntityKey, Metadata};
//!
//! let key = EntityKey::parse("org.example:sensor-1").unwrap();
//! let metadata = Metadata::new(key, 3);
//! assert_eq!(metadata.revision, 3);
//! ```

pub mod bookmark;
pub mod bulk;
pub mod config;
pub mod error;
pub mod key;
pub mod metadata;
pub mod write_model;

pub use bookmark::Bookmark;
pub use bulk::{Ack, BulkFailure, BulkResult, ReindexRequest};
pub use config::{BackgroundSyncSettings, BackoffSettings, Settings, UpdaterSettings};
pub use error::{ExternalError, TypesError};
pub use key::EntityKey;
pub use metadata::{Metadata, UpdateReason};
pub use write_model::{Document, IncrementalUpdateOp, WriteModel};
