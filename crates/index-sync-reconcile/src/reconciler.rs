//! Dual-stream reconciliation.
//!
//! Merges a key-ordered scan of the authoritative store with a key-ordered
//! scan of the index and reports every key on which they disagree:
//!
//! - present only in the store: missing from the index
//! - present only in the index: stale index entry
//! - present in both with different revision or policy revision
//!
//! Inconsistencies are emitted in key order, each followed by progress
//! events naming the last key fully compared on each side.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use index_sync_types::{EntityKey, Metadata, UpdateReason};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One of the two scanned sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The authoritative store
    Persisted,
    /// The search index
    Indexed,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Persisted => f.write_str("persisted"),
            Side::Indexed => f.write_str("indexed"),
        }
    }
}

/// Output of the merge.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent {
    /// The sides disagree about this entity; the metadata carries what has
    /// to be invalidated
    Inconsistent(Metadata),
    /// Every key up to and including `key` on `side` has been compared
    Progress { side: Side, key: EntityKey },
    /// `side` has no more elements
    Finished(Side),
}

/// Merge-comparison of persisted and indexed metadata.
#[derive(Debug, Clone)]
pub struct Reconciler {
    tolerance_window: Duration,
}

impl Reconciler {
    /// Entities modified within `tolerance_window` are not reported, since
    /// their index update may simply still be in flight.
    pub fn new(tolerance_window: Duration) -> Self {
        Self { tolerance_window }
    }

    /// Compare the two scans, yielding inconsistencies and progress.
    ///
    /// Both inputs must be in ascending key order. Elements that do not move
    /// their side forward (replays around a source restart) are dropped, so
    /// each key is reported at most once. The first error of either input is
    /// yielded and ends the stream.
    pub fn reconcile<E>(
        &self,
        persisted: BoxStream<'static, Result<Metadata, E>>,
        indexed: BoxStream<'static, Result<Metadata, E>>,
    ) -> BoxStream<'static, Result<ReconcileEvent, E>>
    where
        E: Send + 'static,
    {
        let merge = Merge {
            persisted: Cursor::new(Side::Persisted, persisted),
            indexed: Cursor::new(Side::Indexed, indexed),
            tolerance_window: self.tolerance_window,
            pending: VecDeque::new(),
            failed: false,
        };

        stream::unfold(merge, |mut merge| async move {
            let item = merge.step().await?;
            Some((item, merge))
        })
        .boxed()
    }

    /// Like [`reconcile`](Self::reconcile), keeping only the inconsistencies.
    pub fn inconsistencies<E>(
        &self,
        persisted: BoxStream<'static, Result<Metadata, E>>,
        indexed: BoxStream<'static, Result<Metadata, E>>,
    ) -> BoxStream<'static, Result<Metadata, E>>
    where
        E: Send + 'static,
    {
        self.reconcile(persisted, indexed)
            .filter_map(|item| {
                future::ready(match item {
                    Ok(ReconcileEvent::Inconsistent(metadata)) => Some(Ok(metadata)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            })
            .boxed()
    }
}

struct Cursor<E> {
    side: Side,
    elements: BoxStream<'static, Result<Metadata, E>>,
    head: Option<Metadata>,
    last: Option<EntityKey>,
    done: bool,
    finish_reported: bool,
}

impl<E> Cursor<E> {
    fn new(side: Side, elements: BoxStream<'static, Result<Metadata, E>>) -> Self {
        Self {
            side,
            elements,
            head: None,
            last: None,
            done: false,
            finish_reported: false,
        }
    }

    /// Buffer the next element ahead of everything consumed so far.
    async fn fill(&mut self) -> Result<(), E> {
        while self.head.is_none() && !self.done {
            match self.elements.next().await {
                Some(Ok(metadata)) => {
                    if self.last.as_ref().is_some_and(|last| metadata.entity_key <= *last) {
                        debug!(side = %self.side, key = %metadata.entity_key, "Dropping replayed element");
                        continue;
                    }
                    self.head = Some(metadata);
                }
                Some(Err(e)) => return Err(e),
                None => self.done = true,
            }
        }
        Ok(())
    }

    fn take(&mut self) -> Option<Metadata> {
        let metadata = self.head.take()?;
        self.last = Some(metadata.entity_key.clone());
        Some(metadata)
    }

    fn report_finished(&mut self, pending: &mut VecDeque<ReconcileEvent>) {
        if self.done && self.head.is_none() && !self.finish_reported {
            self.finish_reported = true;
            pending.push_back(ReconcileEvent::Finished(self.side));
        }
    }
}

struct Merge<E> {
    persisted: Cursor<E>,
    indexed: Cursor<E>,
    tolerance_window: Duration,
    pending: VecDeque<ReconcileEvent>,
    failed: bool,
}

impl<E> Merge<E> {
    async fn step(&mut self) -> Option<Result<ReconcileEvent, E>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.failed {
                return None;
            }

            if let Err(e) = self.persisted.fill().await {
                self.failed = true;
                return Some(Err(e));
            }
            if let Err(e) = self.indexed.fill().await {
                self.failed = true;
                return Some(Err(e));
            }
            self.persisted.report_finished(&mut self.pending);
            self.indexed.report_finished(&mut self.pending);

            let order = match (&self.persisted.head, &self.indexed.head) {
                (None, None) => {
                    if self.pending.is_empty() {
                        return None;
                    }
                    continue;
                }
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(p), Some(i)) => p.entity_key.cmp(&i.entity_key),
            };

            let now = Utc::now();
            match order {
                std::cmp::Ordering::Less => {
                    if let Some(persisted) = self.persisted.take() {
                        self.one_sided(Side::Persisted, persisted, now);
                    }
                }
                std::cmp::Ordering::Greater => {
                    if let Some(indexed) = self.indexed.take() {
                        self.one_sided(Side::Indexed, indexed, now);
                    }
                }
                std::cmp::Ordering::Equal => {
                    if let (Some(persisted), Some(indexed)) =
                        (self.persisted.take(), self.indexed.take())
                    {
                        self.both_sides(persisted, indexed, now);
                    }
                }
            }
        }
    }

    /// The key exists on `side` only.
    ///
    /// The other side's head is beyond `key` (or that side is finished), so
    /// it has no keys up to `key` either and its progress moves along.
    fn one_sided(&mut self, side: Side, metadata: Metadata, now: DateTime<Utc>) {
        let key = metadata.entity_key.clone();
        if metadata.modified_within(self.tolerance_window, now) {
            debug!(key = %key, side = %side, "Recently modified, not reporting");
        } else {
            debug!(key = %key, side = %side, "Entity present on one side only");
            self.pending.push_back(ReconcileEvent::Inconsistent(
                metadata
                    .invalidating_entity()
                    .with_reason(UpdateReason::BackgroundSync),
            ));
        }
        let other = match side {
            Side::Persisted => Side::Indexed,
            Side::Indexed => Side::Persisted,
        };
        self.pending.push_back(ReconcileEvent::Progress {
            side,
            key: key.clone(),
        });
        self.pending.push_back(ReconcileEvent::Progress { side: other, key });
    }

    fn both_sides(&mut self, persisted: Metadata, indexed: Metadata, now: DateTime<Utc>) {
        let key = persisted.entity_key.clone();
        let entity_differs = persisted.revision != indexed.revision;
        let policy_differs = persisted.policy_revision != indexed.policy_revision;

        if entity_differs || policy_differs {
            let recent = persisted.modified_within(self.tolerance_window, now)
                || indexed.modified_within(self.tolerance_window, now);
            if recent {
                debug!(key = %key, "Recently modified, not reporting");
            } else {
                debug!(
                    key = %key,
                    persisted_revision = persisted.revision,
                    indexed_revision = indexed.revision,
                    "Revisions differ"
                );
                let mut metadata = persisted.with_reason(UpdateReason::BackgroundSync);
                metadata.invalidate_entity = entity_differs;
                metadata.invalidate_policy = policy_differs;
                self.pending.push_back(ReconcileEvent::Inconsistent(metadata));
            }
        }

        self.pending.push_back(ReconcileEvent::Progress {
            side: Side::Persisted,
            key: key.clone(),
        });
        self.pending.push_back(ReconcileEvent::Progress {
            side: Side::Indexed,
            key,
        });
    }
}
