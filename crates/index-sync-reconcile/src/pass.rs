//! One reconciliation pass, run as its own task.

use std::sync::Arc;

use futures::StreamExt;
use index_sync_stream::resume_with_backoff;
use index_sync_types::{BackoffSettings, EntityKey, ReindexRequest};
use index_sync_updater::RepairSink;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::progress::ProgressReport;
use crate::reconciler::{ReconcileEvent, Reconciler};
use crate::source::MetadataSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PassOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Sent to the orchestrator when a pass task ends.
#[derive(Debug)]
pub(crate) struct StreamTerminated {
    pub pass_id: u64,
    pub outcome: PassOutcome,
    pub inconsistencies: u64,
}

pub(crate) struct Pass {
    pub id: u64,
    pub start_after: Option<EntityKey>,
    pub persisted: Arc<dyn MetadataSource>,
    pub indexed: Arc<dyn MetadataSource>,
    pub repair: Arc<dyn RepairSink>,
    pub reconciler: Reconciler,
    pub backoff: BackoffSettings,
    pub kill: CancellationToken,
    pub progress: watch::Sender<ProgressReport>,
    pub terminated: mpsc::Sender<StreamTerminated>,
}

impl Pass {
    pub async fn run(self) {
        let persisted = Arc::clone(&self.persisted);
        let persisted = resume_with_backoff(
            "persisted",
            self.start_after.clone(),
            self.backoff.clone(),
            self.kill.clone(),
            move |after| persisted.scan_ordered(after),
        );
        let indexed = Arc::clone(&self.indexed);
        let indexed = resume_with_backoff(
            "indexed",
            self.start_after.clone(),
            self.backoff.clone(),
            self.kill.clone(),
            move |after| indexed.scan_ordered(after),
        );

        let mut events = self.reconciler.reconcile(persisted, indexed);
        let mut report = ProgressReport::new();

        let outcome = loop {
            let event = tokio::select! {
                biased;
                _ = self.kill.cancelled() => break PassOutcome::Cancelled,
                event = events.next() => event,
            };

            match event {
                // sources end early when cancelled
                None if self.kill.is_cancelled() => break PassOutcome::Cancelled,
                None => break PassOutcome::Completed,
                Some(Err(e)) => break PassOutcome::Failed(e.to_string()),
                Some(Ok(event)) => {
                    if let ReconcileEvent::Inconsistent(metadata) = &event {
                        let request = ReindexRequest::from(metadata);
                        debug!(pass = self.id, key = %request.entity_key, "Requesting re-index");
                        if let Err(e) = self.repair.request_reindex(request).await {
                            warn!(pass = self.id, key = %metadata.entity_key, error = %e, "Failed to request re-index");
                        }
                    }
                    report.observe(&event);
                    self.progress.send_replace(report.clone());
                }
            }
        };

        let terminated = StreamTerminated {
            pass_id: self.id,
            outcome,
            inconsistencies: report.inconsistencies,
        };
        if self.terminated.send(terminated).await.is_err() {
            debug!(pass = self.id, "Orchestrator gone, dropping pass result");
        }
    }
}
