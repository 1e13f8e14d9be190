//! Acknowledgement dispatch.

use std::sync::Arc;
use std::time::Duration;

use index_sync_types::{Ack, Metadata};
use tracing::debug;

use crate::collaborators::AckSink;

/// Sends acknowledgements to the shards that originated changes.
///
/// Applied writes are acknowledged after `delay` so the index has time to
/// make them visible to readers; no-op changes are acknowledged right away
/// as weak acks.
#[derive(Clone)]
pub struct Acknowledger {
    sink: Arc<dyn AckSink>,
    delay: Duration,
}

impl Acknowledger {
    pub fn new(sink: Arc<dyn AckSink>, delay: Duration) -> Self {
        Self { sink, delay }
    }

    /// The change required no index write.
    pub fn weak(&self, metadata: &Metadata) {
        self.sink.acknowledge(Ack::weak(metadata));
    }

    /// The changes were applied by the index.
    pub fn applied(&self, acks: Vec<Ack>) {
        if acks.is_empty() {
            return;
        }
        if self.delay.is_zero() {
            acks.into_iter().for_each(|ack| self.sink.acknowledge(ack));
            return;
        }

        let sink = Arc::clone(&self.sink);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(count = acks.len(), "Sending delayed acknowledgements");
            acks.into_iter().for_each(|ack| sink.acknowledge(ack));
        });
    }
}
