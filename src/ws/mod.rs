//! WebSocket connection lifecycle and indexing engine.
//!
//! Upgrade negotiation ([`upgrade`]), per-channel authorization ([`auth`]),
//! the live connection index ([`registry`]) with its paired message queue
//! ([`queue`]), heartbeat monitoring ([`heartbeat`]), and per-message
//! dispatch ([`dispatch`]).

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod heartbeat;
pub mod queue;
pub mod registry;
pub mod upgrade;

pub use auth::ChannelAuthorizer;
pub use connection::{Connection, MessageSink, WsSocket};
pub use dispatch::{MessageDispatcher, WsError};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use queue::MessageQueue;
pub use registry::{ConnectionFilter, ConnectionRegistry, SendOptions};
pub use upgrade::{ConnectionMiddleware, UpgradeError, UpgradePolicy, UpgradeRequest};
