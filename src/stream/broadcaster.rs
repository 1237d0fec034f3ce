//! Fan-out of batch snapshots to the subscribers of each batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use super::messages::ServerMessage;
use super::sink::{ProgressSink, SinkError, SubscriberId};
use crate::batch::{BatchId, BatchSnapshot};
use crate::config::OrchestratorConfig;
use crate::metrics;

/// Delivers progress snapshots per batch id.
///
/// Subscriber lists are copied out before sending, so no map guard is held
/// across an await. A subscriber whose send fails or times out is dropped from
/// every batch; delivery to the others is unaffected.
pub struct ProgressBroadcaster {
    subscriptions: DashMap<BatchId, Vec<Arc<dyn ProgressSink>>>,
    send_timeout: Duration,
}

impl ProgressBroadcaster {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            subscriptions: DashMap::new(),
            send_timeout,
        }
    }

    /// Broadcaster using the orchestrator's send timeout
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.broadcast_send_timeout())
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Add a sink to a batch. Subscribing the same sink twice is a no-op.
    pub fn subscribe(&self, batch_id: BatchId, sink: Arc<dyn ProgressSink>) {
        let id = sink.id();
        let mut entry = self.subscriptions.entry(batch_id).or_default();
        if !entry.iter().any(|existing| existing.id() == id) {
            entry.push(sink);
        }
        debug!(batch_id = %batch_id, subscriber = %id, subscribers = entry.len(), "Subscribed");
    }

    /// Remove a sink from one batch. Returns whether it was subscribed.
    pub fn unsubscribe(&self, batch_id: BatchId, subscriber: SubscriberId) -> bool {
        let removed = match self.subscriptions.get_mut(&batch_id) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|sink| sink.id() != subscriber);
                entry.len() != before
            }
            None => false,
        };
        self.subscriptions
            .remove_if(&batch_id, |_, sinks| sinks.is_empty());
        removed
    }

    /// Remove a sink from every batch, as when its transport closes.
    ///
    /// Returns the number of subscriptions dropped.
    pub fn disconnect(&self, subscriber: SubscriberId) -> usize {
        let mut removed = 0;
        for mut entry in self.subscriptions.iter_mut() {
            let before = entry.len();
            entry.retain(|sink| sink.id() != subscriber);
            removed += before - entry.len();
        }
        self.subscriptions.retain(|_, sinks| !sinks.is_empty());
        if removed > 0 {
            debug!(subscriber = %subscriber, removed, "Subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self, batch_id: BatchId) -> usize {
        self.subscriptions
            .get(&batch_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Send a snapshot to every subscriber of its batch.
    ///
    /// Returns the number of successful deliveries. Never fails.
    pub async fn broadcast(&self, batch_id: BatchId, snapshot: &BatchSnapshot) -> usize {
        let sinks: Vec<Arc<dyn ProgressSink>> = match self.subscriptions.get(&batch_id) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };
        if sinks.is_empty() {
            return 0;
        }

        let message = ServerMessage::update(snapshot);
        let results =
            join_all(sinks.iter().map(|sink| self.deliver(sink.as_ref(), &message))).await;

        let mut delivered = 0;
        let mut failed = HashSet::new();
        for (sink, result) in sinks.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    let reason = match e {
                        SinkError::Timeout => "timeout",
                        _ => "send_failed",
                    };
                    warn!(
                        batch_id = %batch_id,
                        subscriber = %sink.id(),
                        error = %e,
                        "Dropping progress subscriber"
                    );
                    metrics::record_subscriber_pruned(reason);
                    failed.insert(sink.id());
                }
            }
        }

        for subscriber in failed {
            self.disconnect(subscriber);
        }
        delivered
    }

    async fn deliver(
        &self,
        sink: &dyn ProgressSink,
        message: &ServerMessage,
    ) -> Result<(), SinkError> {
        match tokio::time::timeout(self.send_timeout, sink.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ChannelSink;
    use tokio_stream::StreamExt;

    fn snapshot(batch_id: BatchId) -> BatchSnapshot {
        use crate::batch::{BatchCounts, ExecutionStatus};
        BatchSnapshot {
            batch_id,
            status: ExecutionStatus::Running,
            counts: BatchCounts::default(),
            total_duration: 0.0,
            started_at: None,
            completed_at: None,
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_batch_subscribers() {
        let broadcaster = ProgressBroadcaster::default();
        let (a, mut a_rx) = ChannelSink::new(8);
        let (b, mut b_rx) = ChannelSink::new(8);
        broadcaster.subscribe(BatchId(1), Arc::new(a));
        broadcaster.subscribe(BatchId(2), Arc::new(b));

        assert_eq!(broadcaster.broadcast(BatchId(1), &snapshot(BatchId(1))).await, 1);
        assert!(matches!(
            a_rx.next().await,
            Some(ServerMessage::BatchExecutionUpdate { batch_execution_id: BatchId(1), .. })
        ));

        drop(broadcaster);
        assert!(b_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_and_unsubscribe() {
        let broadcaster = ProgressBroadcaster::default();
        let (sink, _rx) = ChannelSink::new(8);
        let id = sink.id();
        let sink: Arc<dyn ProgressSink> = Arc::new(sink);

        broadcaster.subscribe(BatchId(1), sink.clone());
        broadcaster.subscribe(BatchId(1), sink);
        assert_eq!(broadcaster.subscriber_count(BatchId(1)), 1);

        assert!(broadcaster.unsubscribe(BatchId(1), id));
        assert!(!broadcaster.unsubscribe(BatchId(1), id));
        assert_eq!(broadcaster.subscriber_count(BatchId(1)), 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned_everywhere() {
        let broadcaster = ProgressBroadcaster::default();
        let (dead, dead_rx) = ChannelSink::new(8);
        let (live, mut live_rx) = ChannelSink::new(8);
        let dead: Arc<dyn ProgressSink> = Arc::new(dead);
        broadcaster.subscribe(BatchId(1), dead.clone());
        broadcaster.subscribe(BatchId(2), dead);
        broadcaster.subscribe(BatchId(1), Arc::new(live));
        drop(dead_rx);

        assert_eq!(broadcaster.broadcast(BatchId(1), &snapshot(BatchId(1))).await, 1);
        assert!(live_rx.next().await.is_some());
        assert_eq!(broadcaster.subscriber_count(BatchId(1)), 1);
        assert_eq!(broadcaster.subscriber_count(BatchId(2)), 0);
    }

    #[test]
    fn test_send_timeout_comes_from_config() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"broadcast_send_timeout_ms": 250}"#).unwrap();
        let broadcaster = ProgressBroadcaster::from_config(&config);
        assert_eq!(broadcaster.send_timeout(), Duration::from_millis(250));

        let defaults = ProgressBroadcaster::from_config(&OrchestratorConfig::default());
        assert_eq!(defaults.send_timeout(), ProgressBroadcaster::default().send_timeout());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let broadcaster = ProgressBroadcaster::default();
        assert_eq!(broadcaster.broadcast(BatchId(9), &snapshot(BatchId(9))).await, 0);
    }
}
