//! Restart-with-backoff supervision of long-running tasks.

use std::fmt::Display;
use std::future::Future;

use index_sync_types::BackoffSettings;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::StreamError;
use crate::restart::RestartTracker;

/// Run `task` until it completes or `cancel` fires, restarting it with
/// backoff whenever it fails.
///
/// Each invocation of `task` starts from a clean boundary chosen by the task
/// itself (e.g. the next change batch). Returns `Ok(())` on completion or
/// cancellation and [`StreamError::Exhausted`] once the restart cap is hit.
pub async fn supervise<F, Fut, E>(
    name: &str,
    settings: &BackoffSettings,
    cancel: CancellationToken,
    mut task: F,
) -> Result<(), StreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut tracker = RestartTracker::new(settings);

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(task = name, "Supervised task cancelled");
                return Ok(());
            }
            outcome = task() => outcome,
        };

        let e = match outcome {
            Ok(()) => {
                info!(task = name, "Supervised task completed");
                return Ok(());
            }
            Err(e) => e,
        };

        // a run that outlived the recovery period starts a fresh failure count
        tracker.on_success();
        match tracker.on_failure() {
            Some(delay) => {
                warn!(
                    task = name,
                    error = %e,
                    attempt = tracker.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Supervised task failed, restarting"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                error!(
                    task = name,
                    error = %e,
                    failures = tracker.failures(),
                    "Supervised task restarts exhausted"
                );
                return Err(StreamError::Exhausted {
                    name: name.to_string(),
                    failures: tracker.failures(),
                    last_error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(max_restarts: u32) -> BackoffSettings {
        BackoffSettings {
            min_backoff_ms: 10,
            max_backoff_ms: 100,
            random_factor: 0.0,
            max_restarts,
            recovery_ms: 60_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_until_success() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let result = supervise("pipeline", &settings(5), CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("bulk write failed")
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_cap() {
        let result = supervise("pipeline", &settings(1), CancellationToken::new(), || async {
            Err::<(), _>("always failing")
        })
        .await;

        assert_eq!(
            result,
            Err(StreamError::Exhausted {
                name: "pipeline".to_string(),
                failures: 2,
                last_error: "always failing".to_string(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_running_task() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = supervise("pipeline", &settings(5), cancel, || {
            std::future::pending::<Result<(), String>>()
        })
        .await;
        assert!(result.is_ok());
    }
}
