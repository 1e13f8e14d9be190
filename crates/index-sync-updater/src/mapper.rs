//! Update mapping strategies.
//!
//! A mapper decides which index operation, if any, brings the index from the
//! last applied write model to the new one. Strategies are selected by name
//! from configuration.

use std::sync::Arc;

use index_sync_types::{IncrementalUpdateOp, WriteModel};

use crate::error::UpdaterError;

/// Names accepted by [`mapper_for`].
pub const MAPPER_NAMES: &[&str] = &["incremental", "full"];

/// Strategy turning write models into index operations.
pub trait UpdateMapper: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means the index already holds `model`.
    fn map(&self, model: &WriteModel, last: Option<&WriteModel>) -> Option<IncrementalUpdateOp>;
}

/// Emits field-level patches where possible.
pub struct IncrementalMapper;

impl UpdateMapper for IncrementalMapper {
    fn name(&self) -> &'static str {
        "incremental"
    }

    fn map(&self, model: &WriteModel, last: Option<&WriteModel>) -> Option<IncrementalUpdateOp> {
        model.to_incremental(last)
    }
}

/// Always writes whole documents, but still skips no-op updates.
pub struct FullDocumentMapper;

impl UpdateMapper for FullDocumentMapper {
    fn name(&self) -> &'static str {
        "full"
    }

    fn map(&self, model: &WriteModel, last: Option<&WriteModel>) -> Option<IncrementalUpdateOp> {
        model.to_incremental(last)?;
        Some(match model {
            WriteModel::Document { metadata, document } => IncrementalUpdateOp::Replace {
                metadata: metadata.clone(),
                document: document.clone(),
            },
            WriteModel::Deletion { metadata } => IncrementalUpdateOp::Delete {
                metadata: metadata.clone(),
            },
        })
    }
}

/// Look up a mapper by its configured name.
pub fn mapper_for(name: &str) -> Result<Arc<dyn UpdateMapper>, UpdaterError> {
    match name {
        "incremental" => Ok(Arc::new(IncrementalMapper)),
        "full" => Ok(Arc::new(FullDocumentMapper)),
        other => Err(UpdaterError::UnknownMapper(other.to_string())),
    }
}
