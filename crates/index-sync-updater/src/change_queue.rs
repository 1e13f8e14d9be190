//! Coalescing change queue.
//!
//! Notifications arriving between two flushes are merged per entity key, so
//! each key appears at most once per batch. Batches are released on a fixed
//! interval and only when non-empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use index_sync_types::{EntityKey, Metadata};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::ChangeSource;

/// What happened to an enqueued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// First notification for this key since the last flush
    Queued,
    /// Merged into a pending notification for the same key
    Coalesced,
    /// The queue was full; the pending batch of this many keys was discarded
    /// and the notification queued into the now empty queue
    DroppedPending(usize),
}

/// Pending entity changes, at most one per key.
///
/// When a new key arrives while `max_pending` keys are already waiting, the
/// whole pending batch is discarded. Dropped changes are not acknowledged,
/// so their origins redeliver them and background sync repairs what is lost.
pub struct ChangeQueue {
    pending: Mutex<HashMap<EntityKey, Metadata>>,
    max_pending: usize,
}

impl ChangeQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    /// Add a notification, merging it with any pending one for the same key.
    pub fn enqueue(&self, metadata: Metadata) -> EnqueueOutcome {
        let metadata = metadata.received(Utc::now());
        let mut pending = self.pending.lock();

        if let Some(existing) = pending.get_mut(&metadata.entity_key) {
            *existing = existing.clone().coalesce(metadata);
            return EnqueueOutcome::Coalesced;
        }

        let mut outcome = EnqueueOutcome::Queued;
        if pending.len() >= self.max_pending {
            let dropped = pending.len();
            pending.clear();
            warn!(
                dropped,
                max_pending = self.max_pending,
                "Change queue full, dropping pending batch"
            );
            outcome = EnqueueOutcome::DroppedPending(dropped);
        }
        pending.insert(metadata.entity_key.clone(), metadata);
        outcome
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remove and return everything pending.
    pub fn take_batch(&self) -> HashMap<EntityKey, Metadata> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Release one batch per `interval`, skipping empty ones.
    ///
    /// The stream ends when `cancel` fires. It can be recreated at any time;
    /// keys not yet taken stay queued.
    pub fn batches(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> BoxStream<'static, HashMap<EntityKey, Metadata>> {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        stream::unfold(
            (Arc::clone(self), ticker, cancel),
            |(queue, mut ticker, cancel)| async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = ticker.tick() => {}
                    }
                    let batch = queue.take_batch();
                    if !batch.is_empty() {
                        debug!(size = batch.len(), "Releasing change batch");
                        return Some((batch, (queue, ticker, cancel)));
                    }
                }
            },
        )
        .boxed()
    }
}

/// Forward every notification of `source` into `queue` until cancelled or
/// the source completes.
pub fn spawn_change_feed(
    source: Arc<dyn ChangeSource>,
    queue: Arc<ChangeQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = source.subscribe();
        loop {
            let metadata = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = changes.next() => match next {
                    Some(metadata) => metadata,
                    None => break,
                },
            };
            if let EnqueueOutcome::DroppedPending(dropped) = queue.enqueue(metadata) {
                debug!(dropped, "Change feed overflowed the queue");
            }
        }
        info!("Change feed stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use index_sync_types::UpdateReason;

    fn md(name: &str, revision: u64) -> Metadata {
        Metadata::new(EntityKey::new("ns", name).unwrap(), revision)
    }

    struct VecSource(Vec<Metadata>);

    impl ChangeSource for VecSource {
        fn subscribe(&self) -> BoxStream<'static, Metadata> {
            stream::iter(self.0.clone()).boxed()
        }
    }

    #[test]
    fn test_coalesces_per_key() {
        let queue = ChangeQueue::new(10);
        assert_eq!(queue.enqueue(md("a", 1).invalidating_policy()), EnqueueOutcome::Queued);
        assert_eq!(
            queue.enqueue(md("a", 2).with_reason(UpdateReason::EntityUpdate)),
            EnqueueOutcome::Coalesced
        );
        assert_eq!(queue.enqueue(md("b", 1)), EnqueueOutcome::Queued);

        let batch = queue.take_batch();
        assert_eq!(batch.len(), 2);
        let a = &batch[&EntityKey::new("ns", "a").unwrap()];
        assert_eq!(a.revision, 2);
        assert!(a.invalidate_policy);
        assert_eq!(a.reason, UpdateReason::EntityUpdate);
        assert!(a.received_at.is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_pending_batch() {
        let queue = ChangeQueue::new(2);
        queue.enqueue(md("a", 1));
        queue.enqueue(md("b", 1));
        // known key still coalesces at capacity
        assert_eq!(queue.enqueue(md("b", 2)), EnqueueOutcome::Coalesced);
        assert_eq!(queue.enqueue(md("c", 1)), EnqueueOutcome::DroppedPending(2));

        let batch = queue.take_batch();
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_key(&EntityKey::new("ns", "c").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_time_gated_and_skip_empty() {
        let queue = Arc::new(ChangeQueue::new(10));
        let cancel = CancellationToken::new();
        let mut batches = queue.batches(Duration::from_secs(1), cancel.clone());

        queue.enqueue(md("a", 1));
        queue.enqueue(md("b", 1));
        let start = Instant::now();
        let first = batches.next().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        // the tick at 2s finds nothing pending
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            producer.enqueue(md("c", 1));
        });
        let second = batches.next().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        cancel.cancel();
        assert!(batches.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_feed_fills_queue() {
        let queue = Arc::new(ChangeQueue::new(10));
        let source = Arc::new(VecSource(vec![md("a", 1), md("a", 2), md("b", 1)]));

        spawn_change_feed(source, Arc::clone(&queue), CancellationToken::new())
            .await
            .unwrap();

        let batch = queue.take_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[&EntityKey::new("ns", "a").unwrap()].revision, 2);
    }
}
