//! Entity metadata.
//!
//! Metadata describes one observed state of an entity: its revision, the
//! revision of the policy governing it, and what has to be invalidated
//! before it is re-indexed. Instances are never mutated in place; the
//! builder-style methods consume and return a new value.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::EntityKey;

/// Why an entity is being (re-)indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    #[default]
    Unknown,
    /// The entity itself changed
    EntityUpdate,
    /// The policy governing the entity changed
    PolicyUpdate,
    /// Drift found by background reconciliation
    BackgroundSync,
    /// A bulk write for the entity failed
    WriteFailure,
    /// Requested by an operator
    ManualReindex,
}

impl std::fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateReason::Unknown => "unknown",
            UpdateReason::EntityUpdate => "entity_update",
            UpdateReason::PolicyUpdate => "policy_update",
            UpdateReason::BackgroundSync => "background_sync",
            UpdateReason::WriteFailure => "write_failure",
            UpdateReason::ManualReindex => "manual_reindex",
        };
        f.write_str(s)
    }
}

/// Observed state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub entity_key: EntityKey,

    pub revision: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_revision: Option<u64>,

    /// Last modification time as recorded by the side that produced this metadata
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub modified: Option<DateTime<Utc>>,

    #[serde(default)]
    pub invalidate_entity: bool,

    #[serde(default)]
    pub invalidate_policy: bool,

    #[serde(default)]
    pub reason: UpdateReason,

    /// Shard that delivered the change; acknowledgements are routed back to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// When the change was first observed by this process. Not persisted.
    #[serde(skip)]
    pub received_at: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn new(entity_key: EntityKey, revision: u64) -> Self {
        Self {
            entity_key,
            revision,
            policy_revision: None,
            modified: None,
            invalidate_entity: false,
            invalidate_policy: false,
            reason: UpdateReason::Unknown,
            origin: None,
            received_at: None,
        }
    }

    pub fn with_policy_revision(mut self, policy_revision: u64) -> Self {
        self.policy_revision = Some(policy_revision);
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_reason(mut self, reason: UpdateReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Start the consistency timer if it is not running yet.
    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received_at.get_or_insert(at);
        self
    }

    pub fn invalidating_entity(mut self) -> Self {
        self.invalidate_entity = true;
        self
    }

    pub fn invalidating_policy(mut self) -> Self {
        self.invalidate_policy = true;
        self
    }

    /// Combine with a newer notification for the same entity.
    ///
    /// The newer metadata wins, invalidation flags are OR-combined and the
    /// earliest consistency timer is kept.
    ///
    /// Only one origin survives: the newer one, or the older one if the newer
    /// notification carries none. A shard whose origin was replaced receives
    /// no acknowledgement and redelivers its notification.
    pub fn coalesce(self, newer: Metadata) -> Metadata {
        let received_at = match (self.received_at, newer.received_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Metadata {
            invalidate_entity: self.invalidate_entity || newer.invalidate_entity,
            invalidate_policy: self.invalidate_policy || newer.invalidate_policy,
            received_at,
            origin: newer.origin.or(self.origin),
            ..newer
        }
    }

    /// Whether `modified` lies within `window` before `now`.
    pub fn modified_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match (self.modified, chrono::Duration::from_std(window)) {
            (Some(modified), Ok(window)) => modified > now - window,
            _ => false,
        }
    }

    /// Time since the change was first observed.
    pub fn consistency_lag(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.received_at
            .and_then(|start| (now - start).to_std().ok())
    }
}
