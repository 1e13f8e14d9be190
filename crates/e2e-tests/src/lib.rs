//! Shared test harness for end-to-end tests.
//!
//! Provides in-memory stand-ins for every external system the update
//! pipeline and background sync talk to, wired together the way a
//! deployment wires the real ones: repair requests feed the change queue,
//! so drift found by reconciliation is fixed by the pipeline.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use index_sync_reconcile::{BookmarkStore, MetadataSource, Reconciler, SyncCollaborators};
use index_sync_types::{
    Ack, BackgroundSyncSettings, BackoffSettings, BulkResult, Document, EntityKey, ExternalError,
    IncrementalUpdateOp, Metadata, ReindexRequest, UpdaterSettings, WriteModel,
};
use index_sync_updater::{
    AckSink, ChangeQueue, Collaborators, Enforcement, IndexWriter, NamespaceBlocklist, RepairSink,
    UpdatePipeline,
};
use parking_lot::Mutex;
use serde_json::Value;

/// Parse a key, defaulting the namespace to `ns`.
pub fn key(raw: &str) -> EntityKey {
    let raw = if raw.contains(':') {
        raw.to_string()
    } else {
        format!("ns:{raw}")
    };
    EntityKey::parse(raw).expect("valid test key")
}

pub fn document(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn key_filter(start_after: Option<EntityKey>) -> impl Fn(&EntityKey) -> bool {
    move |key: &EntityKey| start_after.as_ref().map_or(true, |after| key > after)
}

fn delayed_scan(items: Vec<Metadata>, delay: Duration) -> BoxStream<'static, Result<Metadata, ExternalError>> {
    if delay.is_zero() {
        return stream::iter(items.into_iter().map(Ok)).boxed();
    }
    stream::iter(items)
        .then(move |metadata| async move {
            tokio::time::sleep(delay).await;
            Ok(metadata)
        })
        .boxed()
}

#[derive(Debug, Clone)]
struct StoredEntity {
    revision: u64,
    policy_revision: Option<u64>,
    document: Document,
}

/// Authoritative entity store. Also answers enforcement: every stored
/// entity is visible with its stored document.
#[derive(Default)]
pub struct EntityStore {
    entities: Mutex<BTreeMap<EntityKey, StoredEntity>>,
    scan_delay: Mutex<Duration>,
    openings: Mutex<Vec<Option<EntityKey>>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entity and return the change notification for it.
    pub fn put(&self, raw_key: &str, revision: u64, value: Value) -> Metadata {
        self.put_with_policy(raw_key, revision, None, value)
    }

    pub fn put_with_policy(
        &self,
        raw_key: &str,
        revision: u64,
        policy_revision: Option<u64>,
        value: Value,
    ) -> Metadata {
        let entity_key = key(raw_key);
        self.entities.lock().insert(
            entity_key.clone(),
            StoredEntity {
                revision,
                policy_revision,
                document: document(value),
            },
        );
        let metadata = Metadata::new(entity_key, revision);
        match policy_revision {
            Some(policy_revision) => metadata.with_policy_revision(policy_revision),
            None => metadata,
        }
    }

    pub fn remove(&self, raw_key: &str) -> Metadata {
        let entity_key = key(raw_key);
        let revision = self
            .entities
            .lock()
            .remove(&entity_key)
            .map_or(0, |entity| entity.revision + 1);
        Metadata::new(entity_key, revision)
    }

    /// Slow every scanned element down by `delay`.
    pub fn set_scan_delay(&self, delay: Duration) {
        *self.scan_delay.lock() = delay;
    }

    /// `start_after` of every scan opened so far.
    pub fn openings(&self) -> Vec<Option<EntityKey>> {
        self.openings.lock().clone()
    }

    pub fn document(&self, raw_key: &str) -> Option<Document> {
        self.entities.lock().get(&key(raw_key)).map(|e| e.document.clone())
    }
}

#[async_trait]
impl Enforcement for EntityStore {
    async fn compute_write_model(
        &self,
        key: &EntityKey,
        change: &Metadata,
    ) -> Result<WriteModel, ExternalError> {
        let model = match self.entities.lock().get(key) {
            Some(entity) => {
                let mut metadata = Metadata::new(key.clone(), entity.revision);
                metadata.policy_revision = entity.policy_revision;
                WriteModel::Document {
                    metadata,
                    document: entity.document.clone(),
                }
            }
            None => WriteModel::Deletion {
                metadata: Metadata::new(key.clone(), change.revision),
            },
        };
        Ok(model)
    }
}

impl MetadataSource for EntityStore {
    fn scan_ordered(
        &self,
        start_after: Option<EntityKey>,
    ) -> BoxStream<'static, Result<Metadata, ExternalError>> {
        self.openings.lock().push(start_after.clone());
        let include = key_filter(start_after);
        let items: Vec<Metadata> = self
            .entities
            .lock()
            .iter()
            .filter(|(key, _)| include(*key))
            .map(|(key, entity)| {
                let mut metadata = Metadata::new(key.clone(), entity.revision);
                metadata.policy_revision = entity.policy_revision;
                metadata
            })
            .collect();
        delayed_scan(items, *self.scan_delay.lock())
    }
}

/// One document as held by the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub revision: u64,
    pub policy_revision: Option<u64>,
    pub document: Document,
}

/// In-memory search index executing bulk writes the way the real one
/// does: patches are refused unless the expected revision is present.
#[derive(Default)]
pub struct SearchIndex {
    docs: Mutex<BTreeMap<EntityKey, IndexedDocument>>,
    ops: Mutex<Vec<&'static str>>,
    bulks: AtomicUsize,
    unavailable: AtomicBool,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a document directly, bypassing the pipeline.
    pub fn seed(&self, raw_key: &str, revision: u64, policy_revision: Option<u64>, value: Value) {
        self.docs.lock().insert(
            key(raw_key),
            IndexedDocument {
                revision,
                policy_revision,
                document: document(value),
            },
        );
    }

    /// Change the stored revision behind the pipeline's back.
    pub fn tamper_revision(&self, raw_key: &str, revision: u64) {
        if let Some(doc) = self.docs.lock().get_mut(&key(raw_key)) {
            doc.revision = revision;
        }
    }

    pub fn get(&self, raw_key: &str) -> Option<IndexedDocument> {
        self.docs.lock().get(&key(raw_key)).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.docs.lock().keys().map(|k| k.to_string()).collect()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn bulk_count(&self) -> usize {
        self.bulks.load(Ordering::SeqCst)
    }

    /// Kinds of all operations received, in order.
    pub fn op_kinds(&self) -> Vec<&'static str> {
        self.ops.lock().clone()
    }

    fn apply(&self, op: &IncrementalUpdateOp) -> Result<(), String> {
        let mut docs = self.docs.lock();
        let entity_key = op.entity_key().clone();
        match op {
            IncrementalUpdateOp::Insert { metadata, document }
            | IncrementalUpdateOp::Replace { metadata, document } => {
                docs.insert(
                    entity_key,
                    IndexedDocument {
                        revision: metadata.revision,
                        policy_revision: metadata.policy_revision,
                        document: document.clone(),
                    },
                );
                Ok(())
            }
            IncrementalUpdateOp::Patch {
                metadata,
                expected_revision,
                set,
                unset,
            } => match docs.get_mut(&entity_key) {
                Some(doc) if doc.revision == *expected_revision => {
                    for (field, value) in set {
                        doc.document.insert(field.clone(), value.clone());
                    }
                    for field in unset {
                        doc.document.remove(field);
                    }
                    doc.revision = metadata.revision;
                    doc.policy_revision = metadata.policy_revision;
                    Ok(())
                }
                Some(doc) => Err(format!(
                    "expected revision {expected_revision}, found {}",
                    doc.revision
                )),
                None => Err("document missing".to_string()),
            },
            IncrementalUpdateOp::Delete { .. } => {
                docs.remove(&entity_key);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl IndexWriter for SearchIndex {
    async fn bulk_write(&self, ops: Vec<IncrementalUpdateOp>) -> Result<BulkResult, ExternalError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ExternalError::Unavailable("index offline".to_string()));
        }
        self.bulks.fetch_add(1, Ordering::SeqCst);

        let mut result = BulkResult::new();
        for op in &ops {
            self.ops.lock().push(op.kind());
            match self.apply(op) {
                Ok(()) => result.record_applied(op.entity_key().clone()),
                Err(reason) => result.record_failure(op.entity_key().clone(), reason),
            }
        }
        Ok(result)
    }
}

impl MetadataSource for SearchIndex {
    fn scan_ordered(
        &self,
        start_after: Option<EntityKey>,
    ) -> BoxStream<'static, Result<Metadata, ExternalError>> {
        let include = key_filter(start_after);
        let items: Vec<Metadata> = self
            .docs
            .lock()
            .iter()
            .filter(|(key, _)| include(*key))
            .map(|(key, doc)| {
                let mut metadata = Metadata::new(key.clone(), doc.revision);
                metadata.policy_revision = doc.policy_revision;
                metadata
            })
            .collect();
        delayed_scan(items, Duration::ZERO)
    }
}

/// Namespace blocklist that can be switched into an outage.
#[derive(Default)]
pub struct StaticBlocklist {
    blocked: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl StaticBlocklist {
    pub fn block(&self, namespace: &str) {
        self.blocked.lock().insert(namespace.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl NamespaceBlocklist for StaticBlocklist {
    async fn is_blocked(&self, namespace: &str) -> Result<bool, ExternalError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ExternalError::Timeout("blocklist lookup".to_string()));
        }
        Ok(self.blocked.lock().contains(namespace))
    }
}

#[derive(Default)]
pub struct AckRecorder {
    acks: Mutex<Vec<Ack>>,
}

impl AckRecorder {
    pub fn acks(&self) -> Vec<Ack> {
        self.acks.lock().clone()
    }

    pub fn clear(&self) {
        self.acks.lock().clear();
    }
}

impl AckSink for AckRecorder {
    fn acknowledge(&self, ack: Ack) {
        self.acks.lock().push(ack);
    }
}

/// Records every repair request and turns it into a change notification.
pub struct RepairRecorder {
    requests: Mutex<Vec<ReindexRequest>>,
    queue: Arc<ChangeQueue>,
}

impl RepairRecorder {
    pub fn new(queue: Arc<ChangeQueue>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            queue,
        }
    }

    pub fn requests(&self) -> Vec<ReindexRequest> {
        self.requests.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.entity_key.to_string())
            .collect()
    }
}

#[async_trait]
impl RepairSink for RepairRecorder {
    async fn request_reindex(&self, request: ReindexRequest) -> Result<(), ExternalError> {
        let mut change = Metadata::new(request.entity_key.clone(), 0).with_reason(request.reason);
        change.invalidate_entity = request.invalidate_entity;
        change.invalidate_policy = request.invalidate_policy;
        self.queue.enqueue(change);
        self.requests.lock().push(request);
        Ok(())
    }
}

/// Scan wrapper whose first `failures` openings break after `fail_after`
/// elements.
pub struct FlakySource {
    inner: Arc<dyn MetadataSource>,
    fail_after: usize,
    failures_left: AtomicU32,
    openings: Mutex<Vec<Option<EntityKey>>>,
}

impl FlakySource {
    pub fn new(inner: Arc<dyn MetadataSource>, fail_after: usize, failures: u32) -> Self {
        Self {
            inner,
            fail_after,
            failures_left: AtomicU32::new(failures),
            openings: Mutex::new(Vec::new()),
        }
    }

    pub fn openings(&self) -> Vec<Option<EntityKey>> {
        self.openings.lock().clone()
    }
}

impl MetadataSource for FlakySource {
    fn scan_ordered(
        &self,
        start_after: Option<EntityKey>,
    ) -> BoxStream<'static, Result<Metadata, ExternalError>> {
        self.openings.lock().push(start_after.clone());
        let scan = self.inner.scan_ordered(start_after);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !fail {
            return scan;
        }
        scan.take(self.fail_after)
            .chain(stream::once(async {
                Err(ExternalError::Unavailable("scan cursor lost".to_string()))
            }))
            .boxed()
    }
}

/// Backoff short enough for tests.
pub fn fast_backoff() -> BackoffSettings {
    BackoffSettings {
        min_backoff_ms: 10,
        max_backoff_ms: 50,
        random_factor: 0.0,
        max_restarts: 5,
        recovery_ms: 1_000,
    }
}

/// Test harness with in-memory collaborators.
pub struct TestHarness {
    pub _temp_dir: tempfile::TempDir,
    pub store: Arc<EntityStore>,
    pub index: Arc<SearchIndex>,
    pub blocklist: Arc<StaticBlocklist>,
    pub acks: Arc<AckRecorder>,
    pub repairs: Arc<RepairRecorder>,
    pub queue: Arc<ChangeQueue>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let queue = Arc::new(ChangeQueue::new(1_000));
        Self {
            _temp_dir: temp_dir,
            store: Arc::new(EntityStore::new()),
            index: Arc::new(SearchIndex::new()),
            blocklist: Arc::new(StaticBlocklist::default()),
            acks: Arc::new(AckRecorder::default()),
            repairs: Arc::new(RepairRecorder::new(Arc::clone(&queue))),
            queue,
        }
    }

    pub fn bookmark_path(&self) -> PathBuf {
        self._temp_dir.path().join("bookmark.json")
    }

    pub fn updater_settings() -> UpdaterSettings {
        UpdaterSettings {
            write_interval_ms: 100,
            max_bulk_size: 2,
            ack_delay_ms: 0,
            backoff: fast_backoff(),
            ..Default::default()
        }
    }

    pub fn sync_settings() -> BackgroundSyncSettings {
        BackgroundSyncSettings {
            enabled: false,
            quiet_period_secs: 5,
            tolerance_window_secs: 0,
            keep_events: 10,
            bookmark_stall_ticks: 3,
            backoff: fast_backoff(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            enforcement: self.store.clone(),
            writer: self.index.clone(),
            blocklist: self.blocklist.clone(),
            acks: self.acks.clone(),
            repair: self.repairs.clone(),
        }
    }

    pub fn pipeline(&self) -> UpdatePipeline {
        UpdatePipeline::new(Self::updater_settings(), self.collaborators())
            .expect("Failed to create pipeline")
    }

    pub fn sync_collaborators(&self, bookmarks: Arc<dyn BookmarkStore>) -> SyncCollaborators {
        SyncCollaborators {
            persisted: self.store.clone(),
            indexed: self.index.clone(),
            bookmarks,
            repair: self.repairs.clone(),
        }
    }

    /// Put an entity into the store and notify the pipeline about it.
    pub fn write_entity(&self, raw_key: &str, revision: u64, value: Value) {
        let change = self.store.put(raw_key, revision, value);
        self.queue.enqueue(change.with_origin("shard-1"));
    }

    /// Keys on which store and index currently disagree.
    pub async fn drift(&self) -> Vec<String> {
        Reconciler::new(Duration::ZERO)
            .inconsistencies(self.store.scan_ordered(None), self.index.scan_ordered(None))
            .map(|item| item.expect("scan failed").entity_key.to_string())
            .collect::<Vec<_>>()
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
