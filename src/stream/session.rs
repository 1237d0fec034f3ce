//! Per-connection handling of subscriber control messages.

use std::sync::Arc;

use tracing::debug;

use super::broadcaster::ProgressBroadcaster;
use super::messages::{ClientMessage, ServerMessage};
use super::sink::ProgressSink;

/// One subscriber connection: parses its control messages and manages its
/// subscriptions. The transport owns reading and writing frames.
pub struct ControlSession {
    broadcaster: Arc<ProgressBroadcaster>,
    sink: Arc<dyn ProgressSink>,
}

impl ControlSession {
    pub fn new(broadcaster: Arc<ProgressBroadcaster>, sink: Arc<dyn ProgressSink>) -> Self {
        Self { broadcaster, sink }
    }

    /// Handle one text frame and return the reply to send back.
    ///
    /// Malformed input produces an `error` reply; the session stays open.
    pub fn handle_text(&self, text: &str) -> ServerMessage {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message),
            Err(e) => {
                debug!(subscriber = %self.sink.id(), error = %e, "Rejected control message");
                ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                }
            }
        }
    }

    pub fn handle(&self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::SubscribeBatch { batch_execution_id } => {
                self.broadcaster
                    .subscribe(batch_execution_id, self.sink.clone());
                ServerMessage::SubscriptionConfirmed {
                    batch_execution_id,
                    message: format!("Subscribed to progress of batch {batch_execution_id}"),
                }
            }
            ClientMessage::UnsubscribeBatch { batch_execution_id } => {
                self.broadcaster
                    .unsubscribe(batch_execution_id, self.sink.id());
                ServerMessage::UnsubscriptionConfirmed {
                    batch_execution_id,
                    message: format!("Unsubscribed from progress of batch {batch_execution_id}"),
                }
            }
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    /// Drop every subscription held by this connection
    pub fn close(&self) -> usize {
        self.broadcaster.disconnect(self.sink.id())
    }
}
