//! Restart accounting with capped, jittered exponential backoff.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use index_sync_types::BackoffSettings;
use tokio::time::Instant;

/// Tracks consecutive failures of a restartable unit and hands out the delay
/// before the next restart.
///
/// The failure count resets once no failure has been seen for the recovery
/// period, so a source that fails rarely never reaches the cap.
#[derive(Debug)]
pub struct RestartTracker {
    backoff: ExponentialBackoff,
    max_backoff: Duration,
    max_restarts: u32,
    recovery: Duration,
    failures: u32,
    last_failure: Option<Instant>,
}

impl RestartTracker {
    pub fn new(settings: &BackoffSettings) -> Self {
        let mut backoff = ExponentialBackoff {
            initial_interval: settings.min_backoff(),
            max_interval: settings.max_backoff(),
            randomization_factor: settings.random_factor,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        Self {
            backoff,
            max_backoff: settings.max_backoff(),
            max_restarts: settings.max_restarts,
            recovery: settings.recovery(),
            failures: 0,
            last_failure: None,
        }
    }

    /// Record a failure.
    ///
    /// Returns the delay before the next restart, or `None` when the restart
    /// cap is exceeded.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        if self.failures > self.max_restarts {
            return None;
        }
        Some(self.backoff.next_backoff().unwrap_or(self.max_backoff))
    }

    /// Record progress; resets the count after a quiet recovery period.
    pub fn on_success(&mut self) {
        if self.failures == 0 {
            return;
        }
        let recovered = self
            .last_failure
            .map(|at| at.elapsed() >= self.recovery)
            .unwrap_or(true);
        if recovered {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.last_failure = None;
        self.backoff.reset();
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
