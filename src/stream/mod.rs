//! Progress streaming to batch subscribers.
//!
//! [`ProgressBroadcaster`] fans snapshots out per batch id, [`ProgressSink`]
//! abstracts the transport and [`ControlSession`] handles the
//! subscribe/unsubscribe/ping control channel of one connection.

pub mod broadcaster;
pub mod messages;
pub mod session;
pub mod sink;

pub use broadcaster::ProgressBroadcaster;
pub use messages::{ClientMessage, ProgressData, ServerMessage};
pub use session::ControlSession;
pub use sink::{ChannelSink, ProgressSink, SinkError, SubscriberId};
