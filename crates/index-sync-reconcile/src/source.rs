//! Interfaces of the stores background sync reads from and writes to.

use async_trait::async_trait;
use futures::stream::BoxStream;
use index_sync_types::{Bookmark, EntityKey, ExternalError, Metadata};

use crate::error::ReconcileError;

/// Key-ordered scan over the metadata of one side (authoritative store or
/// index).
pub trait MetadataSource: Send + Sync {
    /// Lazily yield metadata with keys strictly greater than `start_after`,
    /// in ascending key order.
    fn scan_ordered(
        &self,
        start_after: Option<EntityKey>,
    ) -> BoxStream<'static, Result<Metadata, ExternalError>>;
}

/// Persistence of the single background sync bookmark.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn get(&self) -> Result<Option<Bookmark>, ReconcileError>;

    async fn set(&self, bookmark: &Bookmark) -> Result<(), ReconcileError>;
}
