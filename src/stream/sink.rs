//! Subscriber endpoints for progress messages.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::messages::ServerMessage;

/// Stable identity of a subscriber across all its subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery failures; any of them gets the subscriber pruned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Subscriber connection closed")]
    Closed,

    #[error("Subscriber did not accept the message in time")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Destination for progress messages (a WebSocket, an in-process channel)
#[async_trait]
pub trait ProgressSink: Send + Sync {
    fn id(&self) -> SubscriberId;

    async fn send(&self, message: &ServerMessage) -> Result<(), SinkError>;
}

/// Sink backed by a bounded in-process channel
#[derive(Clone)]
pub struct ChannelSink {
    id: SubscriberId,
    sender: mpsc::Sender<ServerMessage>,
}

impl ChannelSink {
    /// Create a sink and the stream its messages arrive on
    pub fn new(capacity: usize) -> (Self, ReceiverStream<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let sink = Self {
            id: SubscriberId::new(),
            sender,
        };
        (sink, ReceiverStream::new(receiver))
    }
}

#[async_trait]
impl ProgressSink for ChannelSink {
    fn id(&self) -> SubscriberId {
        self.id
    }

    async fn send(&self, message: &ServerMessage) -> Result<(), SinkError> {
        self.sender
            .send(message.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}
