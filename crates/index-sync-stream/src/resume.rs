//! Checkpointed, resumable key-ordered sources.
//!
//! When the upstream source fails, it is reopened strictly after the key of
//! the last element handed downstream, after a backoff delay. Elements may be
//! delivered twice around a restart (at-least-once) but never out of order.

use std::fmt::Display;

use futures::stream::{self, BoxStream, StreamExt};
use index_sync_types::{BackoffSettings, EntityKey, Metadata};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::StreamError;
use crate::restart::RestartTracker;

/// Elements that expose the key they are ordered by.
pub trait Keyed {
    fn key(&self) -> &EntityKey;
}

impl Keyed for Metadata {
    fn key(&self) -> &EntityKey {
        &self.entity_key
    }
}

struct ResumeState<T, E, F> {
    name: &'static str,
    open: F,
    upstream: Option<BoxStream<'static, Result<T, E>>>,
    last_key: Option<EntityKey>,
    tracker: RestartTracker,
    cancel: CancellationToken,
    finished: bool,
}

impl<T, E, F> ResumeState<T, E, F>
where
    T: Keyed + Send + 'static,
    E: Display + Send + 'static,
    F: FnMut(Option<EntityKey>) -> BoxStream<'static, Result<T, E>> + Send + 'static,
{
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        loop {
            if self.finished {
                return None;
            }

            if self.upstream.is_none() {
                debug!(source = self.name, after = ?self.last_key, "Opening source");
                self.upstream = Some((self.open)(self.last_key.clone()));
            }
            let upstream = self.upstream.as_mut()?;

            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(source = self.name, "Source cancelled");
                    self.finished = true;
                    return None;
                }
                item = upstream.next() => item,
            };

            match item {
                Some(Ok(element)) => {
                    if let Some(last) = &self.last_key {
                        if element.key() < last {
                            debug!(
                                source = self.name,
                                key = %element.key(),
                                last = %last,
                                "Dropping element behind resume point"
                            );
                            continue;
                        }
                    }
                    self.last_key = Some(element.key().clone());
                    self.tracker.on_success();
                    return Some(Ok(element));
                }
                Some(Err(e)) => {
                    self.upstream = None;
                    match self.tracker.on_failure() {
                        Some(delay) => {
                            warn!(
                                source = self.name,
                                error = %e,
                                attempt = self.tracker.failures(),
                                retry_in_ms = delay.as_millis() as u64,
                                after = ?self.last_key,
                                "Source failed, restarting"
                            );
                            tokio::select! {
                                biased;
                                _ = self.cancel.cancelled() => {
                                    self.finished = true;
                                    return None;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            error!(
                                source = self.name,
                                error = %e,
                                failures = self.tracker.failures(),
                                "Source restarts exhausted"
                            );
                            self.finished = true;
                            return Some(Err(StreamError::Exhausted {
                                name: self.name.to_string(),
                                failures: self.tracker.failures(),
                                last_error: e.to_string(),
                            }));
                        }
                    }
                }
                None => {
                    debug!(source = self.name, "Source completed");
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

/// Wrap a key-ordered source so that it survives upstream failures.
///
/// `open(after)` must produce elements with keys strictly greater than
/// `after` (or from the beginning when `None`), in non-decreasing key order.
/// The returned stream ends when the source completes or `cancel` fires, and
/// yields a single [`StreamError::Exhausted`] before ending when the restart
/// cap is exceeded.
pub fn resume_with_backoff<T, E, F>(
    name: &'static str,
    start_after: Option<EntityKey>,
    settings: BackoffSettings,
    cancel: CancellationToken,
    open: F,
) -> BoxStream<'static, Result<T, StreamError>>
where
    T: Keyed + Send + 'static,
    E: Display + Send + 'static,
    F: FnMut(Option<EntityKey>) -> BoxStream<'static, Result<T, E>> + Send + 'static,
{
    let state = ResumeState {
        name,
        open,
        upstream: None,
        last_key: start_after,
        tracker: RestartTracker::new(&settings),
        cancel,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        let item = state.next().await?;
        Some((item, state))
    })
    .boxed()
}
