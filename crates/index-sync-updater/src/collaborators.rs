//! Interfaces of the external systems the update pipeline talks to.

use async_trait::async_trait;
use futures::stream::BoxStream;
use index_sync_types::{
    Ack, BulkResult, EntityKey, ExternalError, IncrementalUpdateOp, Metadata, ReindexRequest,
    WriteModel,
};

/// Authorization-aware document shaping.
///
/// Decides whether an entity is visible and what its index document looks like.
#[async_trait]
pub trait Enforcement: Send + Sync {
    async fn compute_write_model(
        &self,
        key: &EntityKey,
        metadata: &Metadata,
    ) -> Result<WriteModel, ExternalError>;
}

/// Write side of the physical index.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Execute all operations as one bulk write.
    ///
    /// `Err` means nothing is known to be applied; per-operation refusals are
    /// reported in [`BulkResult::failed`].
    async fn bulk_write(&self, ops: Vec<IncrementalUpdateOp>) -> Result<BulkResult, ExternalError>;
}

/// Dynamically maintained set of namespaces that must not be indexed.
#[async_trait]
pub trait NamespaceBlocklist: Send + Sync {
    async fn is_blocked(&self, namespace: &str) -> Result<bool, ExternalError>;
}

/// Delivery acknowledgements back to the shard that sent a change.
pub trait AckSink: Send + Sync {
    fn acknowledge(&self, ack: Ack);
}

/// The single, idempotent "re-index entity X" entry point.
#[async_trait]
pub trait RepairSink: Send + Sync {
    async fn request_reindex(&self, request: ReindexRequest) -> Result<(), ExternalError>;
}

/// Upstream notifications of entity changes.
pub trait ChangeSource: Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, Metadata>;
}
