//! collab-crdt: Conflict-free replicated text, chat and presence for
//! real-time collaborative editing.
//!
//! Several participants edit the same plain-text document over unreliable
//! links and converge without a central arbiter. The crate provides:
//!
//! - **Core identifiers** - Lamport-style operation ids and state vectors
//! - **Text CRDT** - RGA character sequence with tombstones and snapshots
//! - **Chat log** - Append-only, causally ordered message log
//! - **Awareness** - Expiring per-participant presence (name, color, cursor)
//! - **Sync** - Connection state machine, wire protocol and pluggable links
//! - **Binding** - Offset translation between an editor widget and the document
//!
//! # Quick Start
//!
//! ```rust
//! use collab_crdt::{CausalClock, TextDocument};
//!
//! let mut alice = TextDocument::new();
//! let mut clock = CausalClock::new(1);
//! let ops = alice.insert_str(&mut clock, 0, "hello").unwrap();
//!
//! let mut bob = TextDocument::new();
//! for op in ops {
//!     bob.apply_remote(op).unwrap();
//! }
//! assert_eq!(bob.visible_text(), "hello");
//! ```
//!
//! # Features
//!
//! - `websocket` (default) - Enables [`sync::WebSocketConnector`]

// Identifiers, state vectors and the causal clock
pub mod core;

// Replicated structures
pub mod awareness;
pub mod chat;
pub mod text;

// One participant's state and operation log
pub mod replica;

// Room synchronization
pub mod sync;

// Session handle, widget binding and tunables
pub mod binding;
pub mod config;
pub mod identity;
pub mod session;

pub use core::{CausalClock, OpId, ReplicaId, StateVector, random_replica_id};

pub use text::{
    AppliedEffect, CharItem, EncodedState, SnapshotError, TextChange, TextDocument, TextError,
    TextOp,
};

pub use chat::{ChatEntry, ChatError, ChatLog, ChatMessage};

pub use awareness::{AwarenessChange, AwarenessTracker, AwarenessUpdate, FieldValue, Fields};

pub use replica::{ApplyOutcome, Operation, Payload, Replica};

pub use sync::{
    ConnectionState, Connector, Link, MemoryRelay, MessageBody, ProtocolError, TransportError,
    ValidationLimits, WireMessage,
};

#[cfg(feature = "websocket")]
pub use sync::WebSocketConnector;

pub use binding::{EditorBinding, EditorEdit, EditorSink, OffsetEncoding};
pub use config::{ConfigError, SessionConfig};
pub use identity::Participant;
pub use session::{ChangeOrigin, Session, SessionError, TextEvent};
