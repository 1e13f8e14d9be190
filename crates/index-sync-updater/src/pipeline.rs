//! Update pipeline.
//!
//! Turns change batches into bulk index writes:
//!
//! 1. Drop keys of blocked namespaces
//! 2. Compute the write model of every remaining key via enforcement
//! 3. Drop write models of blocked namespaces (the blocklist may have changed)
//! 4. Diff each model against the last applied one; acknowledge no-ops
//! 5. Write the operations in bulks, acknowledge what was applied and
//!    request repair for what the index refused
//!
//! Batches are processed one after another, so two writes for the same key
//! never race.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use index_sync_stream::supervise;
use index_sync_types::{
    Ack, BulkResult, EntityKey, IncrementalUpdateOp, Metadata, ReindexRequest, UpdateReason,
    UpdaterSettings, WriteModel,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack::Acknowledger;
use crate::cache::WriteModelCache;
use crate::change_queue::ChangeQueue;
use crate::collaborators::{AckSink, Enforcement, IndexWriter, NamespaceBlocklist, RepairSink};
use crate::error::UpdaterError;
use crate::mapper::{mapper_for, UpdateMapper};
use crate::namespace::NamespaceFilter;

/// External systems the pipeline depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub enforcement: Arc<dyn Enforcement>,
    pub writer: Arc<dyn IndexWriter>,
    pub blocklist: Arc<dyn NamespaceBlocklist>,
    pub acks: Arc<dyn AckSink>,
    pub repair: Arc<dyn RepairSink>,
}

/// An index operation together with the write model it realizes.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub model: WriteModel,
    pub op: IncrementalUpdateOp,
}

/// Result of updating the index for one change batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Keys in the batch
    pub entities: usize,
    /// Operations the index applied
    pub applied: usize,
    /// Operations the index refused
    pub failed: usize,
}

impl BatchOutcome {
    pub fn new(entities: usize) -> Self {
        Self {
            entities,
            ..Default::default()
        }
    }

    pub fn record(&mut self, result: &BulkResult) {
        self.applied += result.applied.len();
        self.failed += result.failed.len();
    }

    /// Keys that needed no write, were blocked or could not be enforced.
    pub fn skipped(&self) -> usize {
        self.entities.saturating_sub(self.applied + self.failed)
    }
}

/// Change-driven index updater.
pub struct UpdatePipeline {
    enforcement: Arc<dyn Enforcement>,
    writer: Arc<dyn IndexWriter>,
    repair: Arc<dyn RepairSink>,
    namespace_filter: NamespaceFilter,
    mapper: Arc<dyn UpdateMapper>,
    cache: WriteModelCache,
    acknowledger: Acknowledger,
    settings: UpdaterSettings,
}

impl UpdatePipeline {
    pub fn new(settings: UpdaterSettings, collaborators: Collaborators) -> Result<Self, UpdaterError> {
        settings.validate().map_err(UpdaterError::InvalidSettings)?;
        let mapper = mapper_for(&settings.mapper)?;
        info!(
            mapper = mapper.name(),
            max_bulk_size = settings.max_bulk_size,
            write_interval_ms = settings.write_interval_ms,
            "Creating update pipeline"
        );

        Ok(Self {
            enforcement: collaborators.enforcement,
            writer: collaborators.writer,
            repair: collaborators.repair,
            namespace_filter: NamespaceFilter::new(
                collaborators.blocklist,
                settings.retrieval_parallelism,
            ),
            mapper,
            cache: WriteModelCache::new(settings.cache_capacity, settings.cache_ttl()),
            acknowledger: Acknowledger::new(collaborators.acks, settings.ack_delay()),
            settings,
        })
    }

    pub fn cache(&self) -> &WriteModelCache {
        &self.cache
    }

    /// Plan the index operations for one change batch.
    ///
    /// Changes that need no write are acknowledged weakly here; changes
    /// whose write model cannot be computed are dropped unacknowledged.
    pub fn process_batch(&self, batch: HashMap<EntityKey, Metadata>) -> BoxStream<'_, PlannedWrite> {
        let allowed = self.namespace_filter.filter(
            stream::iter(batch),
            |(key, _): &(EntityKey, Metadata)| key.namespace().to_string(),
        );

        let models = allowed
            .map(move |(key, metadata)| self.compute_write_model(key, metadata))
            .buffer_unordered(self.settings.retrieval_parallelism)
            .filter_map(future::ready);

        self.namespace_filter
            .filter(models, |model: &WriteModel| {
                model.entity_key().namespace().to_string()
            })
            .filter_map(move |model| future::ready(self.plan(model)))
            .boxed()
    }

    /// Write planned operations in bulks of at most `max_bulk_size`.
    ///
    /// Yields one result per bulk. A failed bulk forgets the applied state
    /// of its keys so that their next update is a full write.
    pub fn execute_writes<'a, S>(&'a self, writes: S) -> BoxStream<'a, Result<BulkResult, UpdaterError>>
    where
        S: Stream<Item = PlannedWrite> + Send + 'a,
    {
        writes
            .chunks(self.settings.max_bulk_size)
            .map(move |chunk| self.write_chunk(chunk))
            .buffer_unordered(self.settings.persistence_parallelism)
            .boxed()
    }

    /// Plan and write one batch. All bulks of the batch are awaited before
    /// the first error, if any, is returned.
    pub async fn update_batch(
        &self,
        batch: HashMap<EntityKey, Metadata>,
    ) -> Result<BatchOutcome, UpdaterError> {
        let mut outcome = BatchOutcome::new(batch.len());
        let mut first_error = None;

        let mut results = self.execute_writes(self.process_batch(batch));
        while let Some(result) = results.next().await {
            match result {
                Ok(result) => outcome.record(&result),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Consume batches from `queue` until `cancel` fires.
    ///
    /// A failed batch restarts the pipeline with backoff at the next batch
    /// boundary; the call fails only once restarts are exhausted.
    pub async fn run(&self, queue: Arc<ChangeQueue>, cancel: CancellationToken) -> Result<(), UpdaterError> {
        supervise("update-pipeline", &self.settings.backoff, cancel.clone(), || {
            self.run_once(&queue, cancel.clone())
        })
        .await?;
        Ok(())
    }

    async fn run_once(
        &self,
        queue: &Arc<ChangeQueue>,
        cancel: CancellationToken,
    ) -> Result<(), UpdaterError> {
        let mut batches = queue.batches(self.settings.write_interval(), cancel);
        while let Some(batch) = batches.next().await {
            let outcome = self.update_batch(batch).await?;
            info!(
                entities = outcome.entities,
                applied = outcome.applied,
                failed = outcome.failed,
                skipped = outcome.skipped(),
                "Change batch written"
            );
        }
        Ok(())
    }

    async fn compute_write_model(&self, key: EntityKey, change: Metadata) -> Option<WriteModel> {
        match self.enforcement.compute_write_model(&key, &change).await {
            Ok(model) => Some(with_change_context(model, &change)),
            Err(e) => {
                warn!(entity = %key, error = %e, "Failed to compute write model, leaving change unacknowledged");
                None
            }
        }
    }

    fn plan(&self, model: WriteModel) -> Option<PlannedWrite> {
        let last = self.cache.get(model.entity_key());
        match self.mapper.map(&model, last.as_ref()) {
            Some(op) => Some(PlannedWrite { model, op }),
            None => {
                debug!(entity = %model.entity_key(), "Index already up to date");
                self.acknowledger.weak(model.metadata());
                None
            }
        }
    }

    async fn write_chunk(&self, chunk: Vec<PlannedWrite>) -> Result<BulkResult, UpdaterError> {
        let ops: Vec<IncrementalUpdateOp> = chunk.iter().map(|write| write.op.clone()).collect();
        let size = ops.len();

        let result = match self.writer.bulk_write(ops).await {
            Ok(result) => result,
            Err(e) => {
                for write in &chunk {
                    self.cache.invalidate(write.model.entity_key());
                }
                warn!(ops = size, error = %e, "Bulk write failed");
                return Err(UpdaterError::BulkWrite { ops: size, source: e });
            }
        };

        let mut models: HashMap<EntityKey, WriteModel> = chunk
            .into_iter()
            .map(|write| (write.model.entity_key().clone(), write.model))
            .collect();

        let now = Utc::now();
        let mut acks = Vec::with_capacity(result.applied.len());
        for key in &result.applied {
            let Some(model) = models.remove(key) else {
                continue;
            };
            let metadata = model.metadata();
            if let Some(lag) = metadata.consistency_lag(now) {
                debug!(
                    entity = %key,
                    reason = %metadata.reason,
                    lag_ms = lag.as_millis() as u64,
                    "Entity consistent in index"
                );
            }
            acks.push(Ack::applied(metadata));
            self.cache.insert(model);
        }

        for failure in &result.failed {
            models.remove(&failure.entity_key);
            self.cache.invalidate(&failure.entity_key);
            warn!(entity = %failure.entity_key, reason = %failure.reason, "Index refused update, requesting repair");
            let request = ReindexRequest::new(failure.entity_key.clone(), UpdateReason::WriteFailure)
                .invalidating_entity();
            if let Err(e) = self.repair.request_reindex(request).await {
                warn!(entity = %failure.entity_key, error = %e, "Failed to request repair");
            }
        }

        // neither applied nor refused: the index state is unknown
        for key in models.keys() {
            debug!(entity = %key, "Bulk result did not report operation");
            self.cache.invalidate(key);
        }

        self.acknowledger.applied(acks);
        Ok(result)
    }
}

/// Carry origin, consistency timer and reason of the triggering change over
/// to the write model computed for it.
fn with_change_context(model: WriteModel, change: &Metadata) -> WriteModel {
    let enrich = |mut metadata: Metadata| {
        if metadata.origin.is_none() {
            metadata.origin = change.origin.clone();
        }
        if metadata.reason == UpdateReason::Unknown {
            metadata.reason = change.reason;
        }
        metadata.received_at = metadata.received_at.or(change.received_at);
        metadata
    };

    match model {
        WriteModel::Document { metadata, document } => WriteModel::Document {
            metadata: enrich(metadata),
            document,
        },
        WriteModel::Deletion { metadata } => WriteModel::Deletion {
            metadata: enrich(metadata),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use index_sync_types::{Document, ExternalError};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::time::Duration;

    #[derive(Default)]
    struct Entities(Mutex<HashMap<EntityKey, (u64, Value)>>);

    impl Entities {
        fn put(&self, name: &str, revision: u64, value: Value) {
            self.0.lock().insert(key(name), (revision, value));
        }
    }

    #[async_trait]
    impl Enforcement for Entities {
        async fn compute_write_model(
            &self,
            key: &EntityKey,
            _metadata: &Metadata,
        ) -> Result<WriteModel, ExternalError> {
            if key.name() == "broken" {
                return Err(ExternalError::Unavailable("policy store".to_string()));
            }
            Ok(match self.0.lock().get(key) {
                Some((revision, value)) => WriteModel::Document {
                    metadata: Metadata::new(key.clone(), *revision),
                    document: value.as_object().cloned().unwrap_or_default(),
                },
                None => WriteModel::Deletion {
                    metadata: Metadata::new(key.clone(), 0),
                },
            })
        }
    }

    #[derive(Default)]
    struct Writer {
        bulks: Mutex<Vec<Vec<IncrementalUpdateOp>>>,
        refuse: Mutex<HashSet<EntityKey>>,
        unavailable: Mutex<bool>,
    }

    impl Writer {
        fn kinds(&self) -> Vec<Vec<&'static str>> {
            self.bulks
                .lock()
                .iter()
                .map(|bulk| bulk.iter().map(|op| op.kind()).collect())
                .collect()
        }
    }

    #[async_trait]
    impl IndexWriter for Writer {
        async fn bulk_write(&self, ops: Vec<IncrementalUpdateOp>) -> Result<BulkResult, ExternalError> {
            if *self.unavailable.lock() {
                return Err(ExternalError::Unavailable("index".to_string()));
            }
            let mut result = BulkResult::new();
            let refuse = self.refuse.lock().clone();
            for op in &ops {
                if refuse.contains(op.entity_key()) {
                    result.record_failure(op.entity_key().clone(), "revision conflict");
                } else {
                    result.record_applied(op.entity_key().clone());
                }
            }
            self.bulks.lock().push(ops);
            Ok(result)
        }
    }

    struct Blocklist;

    #[async_trait]
    impl NamespaceBlocklist for Blocklist {
        async fn is_blocked(&self, namespace: &str) -> Result<bool, ExternalError> {
            Ok(namespace == "blocked")
        }
    }

    #[derive(Default)]
    struct Recorder {
        acks: Mutex<Vec<Ack>>,
        repairs: Mutex<Vec<ReindexRequest>>,
    }

    impl AckSink for Recorder {
        fn acknowledge(&self, ack: Ack) {
            self.acks.lock().push(ack);
        }
    }

    #[async_trait]
    impl RepairSink for Recorder {
        async fn request_reindex(&self, request: ReindexRequest) -> Result<(), ExternalError> {
            self.repairs.lock().push(request);
            Ok(())
        }
    }

    struct Fixture {
        entities: Arc<Entities>,
        writer: Arc<Writer>,
        recorder: Arc<Recorder>,
        pipeline: UpdatePipeline,
    }

    fn fixture(settings: UpdaterSettings) -> Fixture {
        let entities = Arc::new(Entities::default());
        let writer = Arc::new(Writer::default());
        let recorder = Arc::new(Recorder::default());
        let collaborators = Collaborators {
            enforcement: entities.clone(),
            writer: writer.clone(),
            blocklist: Arc::new(Blocklist),
            acks: recorder.clone(),
            repair: recorder.clone(),
        };
        let pipeline = UpdatePipeline::new(settings, collaborators).unwrap();
        Fixture {
            entities,
            writer,
            recorder,
            pipeline,
        }
    }

    fn settings() -> UpdaterSettings {
        UpdaterSettings {
            ack_delay_ms: 0,
            ..Default::default()
        }
    }

    fn key(name: &str) -> EntityKey {
        EntityKey::parse(name).unwrap_or_else(|_| EntityKey::new("ns", name).unwrap())
    }

    fn batch(names: &[&str]) -> HashMap<EntityKey, Metadata> {
        names
            .iter()
            .map(|name| (key(name), Metadata::new(key(name), 1).with_origin("shard-1")))
            .collect()
    }

    #[tokio::test]
    async fn test_first_write_is_full_then_patch_then_noop() {
        let f = fixture(settings());
        f.entities.put("t", 1, json!({"a": 1, "b": 2, "c": 3}));
        f.pipeline.update_batch(batch(&["t"])).await.unwrap();

        f.entities.put("t", 2, json!({"a": 1, "b": 5, "c": 3}));
        f.pipeline.update_batch(batch(&["t"])).await.unwrap();

        let outcome = f.pipeline.update_batch(batch(&["t"])).await.unwrap();
        assert_eq!(outcome.skipped(), 1);

        assert_eq!(f.writer.kinds(), vec![vec!["replace"], vec!["patch"]]);
        let acks = f.recorder.acks.lock();
        let weak: Vec<bool> = acks.iter().map(|ack| ack.weak).collect();
        assert_eq!(weak, vec![false, false, true]);
        assert!(acks.iter().all(|ack| ack.origin.as_deref() == Some("shard-1")));
    }

    #[tokio::test]
    async fn test_blocked_namespace_is_skipped() {
        let f = fixture(settings());
        f.entities.put("ns:t", 1, json!({"a": 1}));
        f.entities.put("blocked:t", 1, json!({"a": 1}));

        let outcome = f.pipeline.update_batch(batch(&["ns:t", "blocked:t"])).await.unwrap();
        assert_eq!(outcome.applied, 1);

        let bulks = f.writer.bulks.lock();
        assert_eq!(bulks.len(), 1);
        assert_eq!(bulks[0][0].entity_key(), &key("ns:t"));
    }

    #[tokio::test]
    async fn test_enforcement_failure_is_not_acknowledged() {
        let f = fixture(settings());
        f.entities.put("ok", 1, json!({"a": 1}));

        let outcome = f.pipeline.update_batch(batch(&["ok", "broken"])).await.unwrap();
        assert_eq!(outcome, BatchOutcome { entities: 2, applied: 1, failed: 0 });

        let acks = f.recorder.acks.lock();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].entity_key, key("ok"));
    }

    #[tokio::test]
    async fn test_bulks_respect_max_bulk_size() {
        let f = fixture(UpdaterSettings {
            max_bulk_size: 2,
            persistence_parallelism: 1,
            ..settings()
        });
        let names = ["a", "b", "c", "d", "e"];
        for name in names {
            f.entities.put(name, 1, json!({"v": name}));
        }

        let outcome = f.pipeline.update_batch(batch(&names)).await.unwrap();
        assert_eq!(outcome.applied, 5);

        let mut sizes: Vec<usize> = f.writer.bulks.lock().iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[tokio::test]
    async fn test_refused_operation_requests_repair() {
        let f = fixture(settings());
        f.entities.put("t", 1, json!({"a": 1, "b": 2, "c": 3}));
        f.pipeline.update_batch(batch(&["t"])).await.unwrap();
        assert!(f.pipeline.cache().get(&key("t")).is_some());

        f.writer.refuse.lock().insert(key("t"));
        f.entities.put("t", 2, json!({"a": 1, "b": 3, "c": 3}));
        let outcome = f.pipeline.update_batch(batch(&["t"])).await.unwrap();
        assert_eq!(outcome.failed, 1);

        assert!(f.pipeline.cache().get(&key("t")).is_none());
        let repairs = f.recorder.repairs.lock();
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].reason, UpdateReason::WriteFailure);
        assert!(repairs[0].invalidate_entity);
        // only the first, applied write was acknowledged
        assert_eq!(f.recorder.acks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_bulk_forgets_applied_state() {
        let f = fixture(settings());
        f.entities.put("t", 1, json!({"a": 1, "b": 2, "c": 3}));
        f.pipeline.update_batch(batch(&["t"])).await.unwrap();

        *f.writer.unavailable.lock() = true;
        f.entities.put("t", 2, json!({"a": 1, "b": 3, "c": 3}));
        let err = f.pipeline.update_batch(batch(&["t"])).await.unwrap_err();
        assert!(matches!(err, UpdaterError::BulkWrite { ops: 1, .. }));

        // the next attempt cannot rely on a diff
        *f.writer.unavailable.lock() = false;
        f.pipeline.update_batch(batch(&["t"])).await.unwrap();
        assert_eq!(f.writer.kinds(), vec![vec!["replace"], vec!["replace"]]);
    }

    #[tokio::test]
    async fn test_missing_entity_becomes_delete() {
        let f = fixture(settings());
        f.pipeline.update_batch(batch(&["gone"])).await.unwrap();
        assert_eq!(f.writer.kinds(), vec![vec!["delete"]]);
    }

    #[test]
    fn test_change_context_is_carried_over() {
        let at = Utc::now();
        let change = Metadata::new(key("t"), 3)
            .with_origin("shard-2")
            .with_reason(UpdateReason::PolicyUpdate)
            .received(at);
        let model = WriteModel::Document {
            metadata: Metadata::new(key("t"), 3),
            document: Document::new(),
        };

        let enriched = with_change_context(model, &change);
        let metadata = enriched.metadata();
        assert_eq!(metadata.origin.as_deref(), Some("shard-2"));
        assert_eq!(metadata.reason, UpdateReason::PolicyUpdate);
        assert_eq!(metadata.received_at, Some(at));
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let recorder = Arc::new(Recorder::default());
        let collaborators = Collaborators {
            enforcement: Arc::new(Entities::default()),
            writer: Arc::new(Writer::default()),
            blocklist: Arc::new(Blocklist),
            acks: recorder.clone(),
            repair: recorder,
        };
        let settings = UpdaterSettings {
            max_bulk_size: 0,
            ..settings()
        };

        match UpdatePipeline::new(settings, collaborators) {
            Err(UpdaterError::InvalidSettings(reason)) => assert!(reason.contains("max_bulk_size")),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("pipeline accepted max_bulk_size = 0"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_until_cancelled() {
        let f = fixture(settings());
        f.entities.put("a", 1, json!({"v": 1}));
        f.entities.put("b", 1, json!({"v": 2}));
        let pipeline = Arc::new(f.pipeline);
        let queue = Arc::new(ChangeQueue::new(100));
        let cancel = CancellationToken::new();

        let runner = {
            let pipeline = Arc::clone(&pipeline);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run(queue, cancel).await })
        };

        queue.enqueue(Metadata::new(key("a"), 1));
        queue.enqueue(Metadata::new(key("b"), 1));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(f.writer.bulks.lock().len(), 1);

        cancel.cancel();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_restarts_after_failed_batch() {
        let f = fixture(settings());
        f.entities.put("a", 1, json!({"v": 1}));
        f.entities.put("b", 1, json!({"v": 2}));
        let pipeline = Arc::new(f.pipeline);
        let queue = Arc::new(ChangeQueue::new(100));
        let cancel = CancellationToken::new();

        let runner = {
            let pipeline = Arc::clone(&pipeline);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run(queue, cancel).await })
        };

        // 1. The first batch hits an unavailable index
        *f.writer.unavailable.lock() = true;
        queue.enqueue(Metadata::new(key("a"), 1));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(f.writer.bulks.lock().is_empty());
        assert!(f.recorder.acks.lock().is_empty());
        assert!(!runner.is_finished());

        // 2. After the backoff a fresh batch stream picks up new changes
        *f.writer.unavailable.lock() = false;
        queue.enqueue(Metadata::new(key("b"), 1));
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(f.writer.kinds(), vec![vec!["replace"]]);
        assert_eq!(f.writer.bulks.lock()[0][0].entity_key(), &key("b"));
        let acks: Vec<EntityKey> = f
            .recorder
            .acks
            .lock()
            .iter()
            .map(|ack| ack.entity_key.clone())
            .collect();
        assert_eq!(acks, vec![key("b")]);

        cancel.cancel();
        assert!(runner.await.unwrap().is_ok());
    }
}
