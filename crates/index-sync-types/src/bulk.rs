//! Bulk write results, acknowledgements and repair requests.

use serde::{Deserialize, Serialize};

use crate::key::EntityKey;
use crate::metadata::{Metadata, UpdateReason};

/// Per-operation failure inside an otherwise executed bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub entity_key: EntityKey,
    pub reason: String,
}

/// Outcome of one bulk write call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    /// Keys whose operation was applied
    pub applied: Vec<EntityKey>,
    /// Operations the index refused (e.g. stale expected revision)
    pub failed: Vec<BulkFailure>,
}

impl BulkResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&mut self, key: EntityKey) {
        self.applied.push(key);
    }

    pub fn record_failure(&mut self, key: EntityKey, reason: impl Into<String>) {
        self.failed.push(BulkFailure {
            entity_key: key,
            reason: reason.into(),
        });
    }

}

/// Acknowledgement routed back to the shard that delivered a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub entity_key: EntityKey,
    pub revision: u64,
    pub origin: Option<String>,
    /// The change resolved to a no-op rather than an applied write
    pub weak: bool,
}

impl Ack {
    pub fn applied(metadata: &Metadata) -> Self {
        Self::from_metadata(metadata, false)
    }

    pub fn weak(metadata: &Metadata) -> Self {
        Self::from_metadata(metadata, true)
    }

    fn from_metadata(metadata: &Metadata, weak: bool) -> Self {
        Self {
            entity_key: metadata.entity_key.clone(),
            revision: metadata.revision,
            origin: metadata.origin.clone(),
            weak,
        }
    }
}

/// Idempotent request to re-index one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReindexRequest {
    pub entity_key: EntityKey,
    pub invalidate_entity: bool,
    pub invalidate_policy: bool,
    pub reason: UpdateReason,
}

impl ReindexRequest {
    pub fn new(entity_key: EntityKey, reason: UpdateReason) -> Self {
        Self {
            entity_key,
            invalidate_entity: false,
            invalidate_policy: false,
            reason,
        }
    }

    pub fn invalidating_entity(mut self) -> Self {
        self.invalidate_entity = true;
        self
    }
}

impl From<&Metadata> for ReindexRequest {
    fn from(metadata: &Metadata) -> Self {
        Self {
            entity_key: metadata.entity_key.clone(),
            invalidate_entity: metadata.invalidate_entity,
            invalidate_policy: metadata.invalidate_policy,
            reason: metadata.reason,
        }
    }
}
