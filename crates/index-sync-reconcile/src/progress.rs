//! Per-side progress of a reconciliation pass.

use index_sync_types::EntityKey;
use serde::{Deserialize, Serialize};

use crate::reconciler::{ReconcileEvent, Side};

/// Furthest key fully compared on each side of the running pass.
///
/// The empty key means nothing has been compared yet on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub persisted: EntityKey,
    pub indexed: EntityKey,
    pub persisted_done: bool,
    pub indexed_done: bool,
    /// Inconsistencies reported so far in this pass
    pub inconsistencies: u64,
}

impl ProgressReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one reconciler event into the report.
    pub fn observe(&mut self, event: &ReconcileEvent) {
        match event {
            ReconcileEvent::Inconsistent(_) => self.inconsistencies += 1,
            ReconcileEvent::Progress { side: Side::Persisted, key } => {
                self.persisted = key.clone();
            }
            ReconcileEvent::Progress { side: Side::Indexed, key } => {
                self.indexed = key.clone();
            }
            ReconcileEvent::Finished(Side::Persisted) => self.persisted_done = true,
            ReconcileEvent::Finished(Side::Indexed) => self.indexed_done = true,
        }
    }

    /// Key up to which both sides have been compared, if any.
    ///
    /// A finished side no longer bounds the other one. Nothing is returned
    /// once both sides are finished, since the pass is about to end.
    pub fn bookmark_candidate(&self) -> Option<EntityKey> {
        let candidate = match (self.persisted_done, self.indexed_done) {
            (true, true) => return None,
            (true, false) => &self.indexed,
            (false, true) => &self.persisted,
            (false, false) => std::cmp::min(&self.persisted, &self.indexed),
        };
        (!candidate.is_empty()).then(|| candidate.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> EntityKey {
        EntityKey::new("ns", name).unwrap()
    }

    fn progress(side: Side, name: &str) -> ReconcileEvent {
        ReconcileEvent::Progress {
            side,
            key: key(name),
        }
    }

    #[test]
    fn test_candidate_is_minimum_of_both_sides() {
        let mut report = ProgressReport::new();
        assert_eq!(report.bookmark_candidate(), None);

        report.observe(&progress(Side::Persisted, "d"));
        // the index side has not compared anything yet
        assert_eq!(report.bookmark_candidate(), None);

        report.observe(&progress(Side::Indexed, "b"));
        assert_eq!(report.bookmark_candidate(), Some(key("b")));
    }

    #[test]
    fn test_finished_side_does_not_bound() {
        let mut report = ProgressReport::new();
        report.observe(&progress(Side::Persisted, "x"));
        report.observe(&progress(Side::Indexed, "c"));
        report.observe(&ReconcileEvent::Finished(Side::Indexed));
        assert_eq!(report.bookmark_candidate(), Some(key("x")));

        report.observe(&ReconcileEvent::Finished(Side::Persisted));
        assert_eq!(report.bookmark_candidate(), None);
    }

    #[test]
    fn test_counts_inconsistencies() {
        let mut report = ProgressReport::new();
        report.observe(&ReconcileEvent::Inconsistent(index_sync_types::Metadata::new(key("a"), 1)));
        assert_eq!(report.inconsistencies, 1);
    }
}
