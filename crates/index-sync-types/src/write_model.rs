//! Write models and incremental index updates.
//!
//! A [`WriteModel`] is what the index should contain for an entity. Diffing
//! it against the last model known to be applied yields the smallest
//! [`IncrementalUpdateOp`] that brings the index up to date, or nothing when
//! the index already matches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::EntityKey;
use crate::metadata::Metadata;

/// Index document body.
pub type Document = serde_json::Map<String, Value>;

/// Desired index representation of one entity at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteModel {
    /// The entity is visible and should be indexed as `document`
    Document { metadata: Metadata, document: Document },
    /// The entity must not be represented in the index
    Deletion { metadata: Metadata },
}

impl WriteModel {
    pub fn metadata(&self) -> &Metadata {
        match self {
            WriteModel::Document { metadata, .. } | WriteModel::Deletion { metadata } => metadata,
        }
    }

    pub fn entity_key(&self) -> &EntityKey {
        &self.metadata().entity_key
    }

    /// Compute the index mutation that turns `last` into `self`.
    ///
    /// `last` is the model most recently confirmed as applied; `None` means
    /// the index state is unknown and a full operation is required. Returns
    /// `None` when nothing has to be written.
    pub fn to_incremental(&self, last: Option<&WriteModel>) -> Option<IncrementalUpdateOp> {
        match (self, last) {
            (WriteModel::Deletion { .. }, Some(WriteModel::Deletion { .. })) => None,
            (WriteModel::Deletion { metadata }, _) => Some(IncrementalUpdateOp::Delete {
                metadata: metadata.clone(),
            }),
            (WriteModel::Document { metadata, document }, None) => {
                Some(IncrementalUpdateOp::Replace {
                    metadata: metadata.clone(),
                    document: document.clone(),
                })
            }
            (WriteModel::Document { metadata, document }, Some(WriteModel::Deletion { .. })) => {
                Some(IncrementalUpdateOp::Insert {
                    metadata: metadata.clone(),
                    document: document.clone(),
                })
            }
            (
                WriteModel::Document { metadata, document },
                Some(WriteModel::Document {
                    metadata: previous,
                    document: previous_document,
                }),
            ) => {
                let (set, unset) = diff_documents(previous_document, document);
                let same_revisions = metadata.revision == previous.revision
                    && metadata.policy_revision == previous.policy_revision;
                if set.is_empty() && unset.is_empty() && same_revisions {
                    return None;
                }
                // a patch touching every field is no smaller than the document
                if set.len() + unset.len() >= document.len() {
                    return Some(IncrementalUpdateOp::Replace {
                        metadata: metadata.clone(),
                        document: document.clone(),
                    });
                }
                Some(IncrementalUpdateOp::Patch {
                    metadata: metadata.clone(),
                    expected_revision: previous.revision,
                    set,
                    unset,
                })
            }
        }
    }
}

/// Top-level field diff: fields to overwrite and fields to remove.
fn diff_documents(previous: &Document, next: &Document) -> (Document, Vec<String>) {
    let set: Document = next
        .iter()
        .filter(|(field, value)| previous.get(*field) != Some(*value))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect();
    let unset: Vec<String> = previous
        .keys()
        .filter(|field| !next.contains_key(*field))
        .cloned()
        .collect();
    (set, unset)
}

/// One element of a bulk index write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IncrementalUpdateOp {
    /// Insert a document known to be absent
    Insert { metadata: Metadata, document: Document },
    /// Upsert the full document
    Replace { metadata: Metadata, document: Document },
    /// Partial update; only valid while the index still holds `expected_revision`
    Patch {
        metadata: Metadata,
        expected_revision: u64,
        set: Document,
        unset: Vec<String>,
    },
    /// Remove the document
    Delete { metadata: Metadata },
}

impl IncrementalUpdateOp {
    pub fn metadata(&self) -> &Metadata {
        match self {
            IncrementalUpdateOp::Insert { metadata, .. }
            | IncrementalUpdateOp::Replace { metadata, .. }
            | IncrementalUpdateOp::Patch { metadata, .. }
            | IncrementalUpdateOp::Delete { metadata } => metadata,
        }
    }

    pub fn entity_key(&self) -> &EntityKey {
        &self.metadata().entity_key
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IncrementalUpdateOp::Insert { .. } => "insert",
            IncrementalUpdateOp::Replace { .. } => "replace",
            IncrementalUpdateOp::Patch { .. } => "patch",
            IncrementalUpdateOp::Delete { .. } => "delete",
        }
    }
}
