//! Namespace blocklist filtering.

use std::sync::Arc;

use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::{debug, warn};

use crate::collaborators::NamespaceBlocklist;

/// Drops elements belonging to blocked namespaces.
///
/// A failed blocklist lookup lets the element through: indexing something
/// that should have been skipped is recoverable, silently losing an update
/// is not.
pub struct NamespaceFilter {
    blocklist: Arc<dyn NamespaceBlocklist>,
    parallelism: usize,
}

impl NamespaceFilter {
    pub fn new(blocklist: Arc<dyn NamespaceBlocklist>, parallelism: usize) -> Self {
        Self {
            blocklist,
            parallelism: parallelism.max(1),
        }
    }

    /// Whether elements of `namespace` may be indexed.
    pub async fn should_update(&self, namespace: &str) -> bool {
        match self.blocklist.is_blocked(namespace).await {
            Ok(true) => {
                debug!(namespace, "Namespace blocked, skipping");
                false
            }
            Ok(false) => true,
            Err(e) => {
                warn!(namespace, error = %e, "Blocklist lookup failed, not filtering");
                true
            }
        }
    }

    /// Keep the elements whose namespace is not blocked, preserving order.
    ///
    /// Up to `parallelism` lookups run concurrently.
    pub fn filter<'a, S, T, F>(&'a self, elements: S, namespace_of: F) -> BoxStream<'a, T>
    where
        S: Stream<Item = T> + Send + 'a,
        T: Send + 'a,
        F: Fn(&T) -> String + Send + Sync + 'a,
    {
        elements
            .map(move |element| {
                let namespace = namespace_of(&element);
                async move { self.should_update(&namespace).await.then_some(element) }
            })
            .buffered(self.parallelism)
            .filter_map(future::ready)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use index_sync_types::ExternalError;

    struct Blocklist;

    #[async_trait]
    impl NamespaceBlocklist for Blocklist {
        async fn is_blocked(&self, namespace: &str) -> Result<bool, ExternalError> {
            match namespace {
                "blocked" => Ok(true),
                "flaky" => Err(ExternalError::Timeout("blocklist".to_string())),
                _ => Ok(false),
            }
        }
    }

    fn filter() -> NamespaceFilter {
        NamespaceFilter::new(Arc::new(Blocklist), 4)
    }

    #[tokio::test]
    async fn test_filters_blocked_namespace_in_order() {
        let filter = filter();
        let input = vec!["open:1", "blocked:2", "open:3", "other:4", "blocked:5"];
        let kept: Vec<&str> = filter
            .filter(stream::iter(input), |raw: &&str| {
                raw.split(':').next().unwrap_or_default().to_string()
            })
            .collect()
            .await;
        assert_eq!(kept, vec!["open:1", "open:3", "other:4"]);
    }

    #[tokio::test]
    async fn test_lookup_error_fails_open() {
        assert!(filter().should_update("flaky").await);
        assert!(!filter().should_update("blocked").await);
    }
}
