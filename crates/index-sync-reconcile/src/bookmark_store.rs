//! Bookmark store implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use index_sync_types::Bookmark;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ReconcileError;
use crate::source::BookmarkStore;

/// Bookmark kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBookmarkStore {
    bookmark: Mutex<Option<Bookmark>>,
}

impl InMemoryBookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bookmark(bookmark: Bookmark) -> Self {
        Self {
            bookmark: Mutex::new(Some(bookmark)),
        }
    }
}

#[async_trait]
impl BookmarkStore for InMemoryBookmarkStore {
    async fn get(&self) -> Result<Option<Bookmark>, ReconcileError> {
        Ok(self.bookmark.lock().clone())
    }

    async fn set(&self, bookmark: &Bookmark) -> Result<(), ReconcileError> {
        *self.bookmark.lock() = Some(bookmark.clone());
        Ok(())
    }
}

/// Bookmark stored as a single JSON document.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so readers never observe a partially written bookmark.
#[derive(Debug, Clone)]
pub struct JsonFileBookmarkStore {
    path: PathBuf,
}

impl JsonFileBookmarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "bookmark".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl BookmarkStore for JsonFileBookmarkStore {
    async fn get(&self) -> Result<Option<Bookmark>, ReconcileError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(Bookmark::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, bookmark: &Bookmark) -> Result<(), ReconcileError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, bookmark.to_bytes()?).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(path = %self.path.display(), last_key = %bookmark.last_key, "Bookmark written");
        Ok(())
    }
}
