//! Health and status reporting of background sync.
//!
//! Lifecycle events are kept in a short history. The health level is the
//! most severe level among the events since the second most recent pass
//! termination, so one failed pass stops affecting health once two later
//! passes have ended.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use index_sync_types::{Bookmark, EntityKey};
use serde::{Deserialize, Serialize};

/// Severity of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Info,
    Warn,
    Error,
}

/// What a status event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PassStarted,
    /// A pass ended, successfully or not
    StreamTerminated,
    BookmarkStalled,
    BookmarkWriteFailed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub at: DateTime<Utc>,
    pub level: HealthLevel,
    pub kind: EventKind,
    pub message: String,
}

impl StatusEvent {
    pub fn new(level: HealthLevel, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            kind,
            message: message.into(),
        }
    }

    pub fn info(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(HealthLevel::Info, kind, message)
    }

    pub fn warn(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(HealthLevel::Warn, kind, message)
    }

    pub fn error(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(HealthLevel::Error, kind, message)
    }
}

/// Bounded history of status events, oldest first.
#[derive(Debug, Clone)]
pub struct EventHistory {
    events: VecDeque<StatusEvent>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: StatusEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Most severe level since (and including) the second most recent
    /// [`EventKind::StreamTerminated`].
    pub fn most_severe(&self) -> HealthLevel {
        let mut level = HealthLevel::Info;
        let mut terminations = 0;
        for event in self.events.iter().rev() {
            level = level.max(event.level);
            if event.kind == EventKind::StreamTerminated {
                terminations += 1;
                if terminations == 2 {
                    break;
                }
            }
        }
        level
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Sleeping,
    Streaming,
}

/// Snapshot returned by the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Whether passes are started automatically
    pub enabled: bool,
    /// Last bookmark read or persisted
    pub bookmark: Bookmark,
    pub progress_persisted: EntityKey,
    pub progress_indexed: EntityKey,
    /// Inconsistencies found by the running pass
    pub inconsistencies: u64,
    pub passes_completed: u64,
    pub level: HealthLevel,
    pub events: Vec<StatusEvent>,
}
