//! Last applied write model per entity.
//!
//! Only models confirmed by the index are stored. A missing or expired entry
//! means the index state is unknown, which makes the mapper emit a full
//! operation instead of a diff.

use std::num::NonZeroUsize;
use std::time::Duration;

use index_sync_types::{EntityKey, WriteModel};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

struct CachedModel {
    model: WriteModel,
    stored_at: Instant,
}

/// Bounded, time-limited cache of applied write models.
pub struct WriteModelCache {
    entries: Mutex<LruCache<EntityKey, CachedModel>>,
    ttl: Duration,
}

impl WriteModelCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<WriteModel> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                return Some(entry.model.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Record `model` as applied.
    pub fn insert(&self, model: WriteModel) {
        let key = model.entity_key().clone();
        self.entries.lock().put(
            key,
            CachedModel {
                model,
                stored_at: Instant::now(),
            },
        );
    }

    /// Forget the applied state of `key`.
    pub fn invalidate(&self, key: &EntityKey) {
        self.entries.lock().pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
