//! Room synchronization over an unreliable link.
//!
//! ```text
//!            connect ok                first SyncStep2 for us
//! Connecting ──────────► Syncing ─────────────────────────────► Connected
//!     ▲                     │          (or sync timeout)            │
//!     │   backoff + jitter  │ link lost / too many bad frames       │
//!     └─────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! While not `Connected`, local operations queue in an outbox and are
//! flushed in order once the room state has been exchanged.

pub mod backoff;
pub mod link;
pub mod protocol;
pub(crate) mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::Backoff;
pub use link::{Connector, Link, MemoryRelay, TransportError};
pub use protocol::{
    MessageBody, PROTOCOL_VERSION, ProtocolError, ValidationLimits, WireMessage, decode_validated,
};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Syncing,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}
