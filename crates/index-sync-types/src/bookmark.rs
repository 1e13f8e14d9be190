//! Background sync bookmark.
//!
//! The bookmark is the only persisted state of background reconciliation:
//! a single record, overwritten on every save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::key::EntityKey;

/// Resumption point of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    /// When the bookmark was written (milliseconds since epoch)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Last key verified on both sides; empty means "start from the beginning"
    pub last_key: EntityKey,
}

impl Bookmark {
    pub fn new(last_key: EntityKey) -> Self {
        Self {
            timestamp: Utc::now(),
            last_key,
        }
    }

    /// Bookmark pointing at the start of the key space.
    pub fn empty() -> Self {
        Self::new(EntityKey::empty())
    }

    /// Exclusive lower bound to resume scanning from.
    pub fn start_after(&self) -> Option<EntityKey> {
        if self.last_key.is_empty() {
            None
        } else {
            Some(self.last_key.clone())
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        serde_json::to_vec(self).map_err(TypesError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(bytes).map_err(TypesError::from)
    }
}
