//! Change-driven index update pipeline.
//!
//! Turns batched entity-change notifications into incremental index writes.
//!
//! ## Key Components
//!
//! - [`ChangeQueue`]: coalesces change notifications per key and releases
//!   them in time-gated batches
//! - [`NamespaceFilter`]: drops elements of blocked namespaces, failing open
//! - [`WriteModelCache`]: last write model confirmed applied, per key
//! - [`UpdateMapper`]: strategy turning a write model into an index operation
//! - [`UpdatePipeline`]: enforcement, diffing, bulk writes and acknowledgements
//!
//! ## Flow
//!
//! 1. A [`ChangeSource`] feeds notifications into the [`ChangeQueue`]
//! 2. Every write interval the queue releases one batch
//! 3. Blocked namespaces are removed, write models are computed by [`Enforcement`]
//! 4. Each model is diffed against the cached last applied model
//! 5. Operations are written in bounded bulks with bounded parallelism
//! 6. Applied and no-op changes are acknowledged to their origin shard
//!
//! ## Example
//!
//! ```ignore
//! use index_sync_updater::{ChangeQueue, Collaborators, UpdatePipeline};
//!
//! let queue = Arc::new(ChangeQueue::new(settings.updater.max_pending_changes));
//! let pipeline = UpdatePipeline::new(settings.updater.clone(), collaborators)?;
//! pipeline.run(queue, cancel).await?;
//! ```

pub mod ack;
pub mod cache;
pub mod change_queue;
pub mod collaborators;
pub mod error;
pub mod mapper;
pub mod namespace;
pub mod pipeline;

pub use ack::Acknowledger;
pub use cache::WriteModelCache;
pub use change_queue::{spawn_change_feed, ChangeQueue, EnqueueOutcome};
pub use collaborators::{AckSink, ChangeSource, Enforcement, IndexWriter, NamespaceBlocklist, RepairSink};
pub use error::UpdaterError;
pub use mapper::{mapper_for, FullDocumentMapper, IncrementalMapper, UpdateMapper, MAPPER_NAMES};
pub use namespace::NamespaceFilter;
pub use pipeline::{BatchOutcome, Collaborators, PlannedWrite, UpdatePipeline};
