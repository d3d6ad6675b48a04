//! Binary wire format for room traffic.
//!
//! ```text
//! ┌─────────┬──────────────────────────────────────┐
//! │ version │ bincode(WireMessage)                 │
//! │ 1 byte  │ variable                             │
//! └─────────┴──────────────────────────────────────┘
//! ```

use crate::awareness::{AwarenessUpdate, Fields};
use crate::core::{ReplicaId, StateVector};
use crate::replica::Operation;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// "Here is what I have; send me what I lack."
    SyncStep1 { state_vector: StateVector },
    /// Answer to a `SyncStep1` from `target`.
    SyncStep2 {
        target: ReplicaId,
        operations: Vec<Operation>,
    },
    /// Freshly generated local operations.
    Update { operations: Vec<Operation> },
    Awareness {
        participant: ReplicaId,
        fields: Option<Fields>,
        timestamp: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub sender: ReplicaId,
    pub body: MessageBody,
}

impl WireMessage {
    pub fn sync_step1(sender: ReplicaId, state_vector: StateVector) -> Self {
        Self {
            sender,
            body: MessageBody::SyncStep1 { state_vector },
        }
    }

    pub fn sync_step2(sender: ReplicaId, target: ReplicaId, operations: Vec<Operation>) -> Self {
        Self {
            sender,
            body: MessageBody::SyncStep2 { target, operations },
        }
    }

    pub fn update(sender: ReplicaId, operations: Vec<Operation>) -> Self {
        Self {
            sender,
            body: MessageBody::Update { operations },
        }
    }

    pub fn awareness(sender: ReplicaId, update: AwarenessUpdate) -> Self {
        Self {
            sender,
            body: MessageBody::Awareness {
                participant: update.participant,
                fields: update.fields,
                timestamp: update.timestamp,
            },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = vec![PROTOCOL_VERSION];
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&version, payload) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let (message, consumed): (WireMessage, usize) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if consumed != payload.len() {
            return Err(ProtocolError::TrailingBytes(payload.len() - consumed));
        }
        Ok(message)
    }

    pub fn operations(&self) -> &[Operation] {
        match &self.body {
            MessageBody::SyncStep2 { operations, .. } | MessageBody::Update { operations } => {
                operations
            }
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("limit exceeded: {actual} > {limit}")]
    LimitExceeded { limit: usize, actual: usize },
    #[error("malformed operation: {0}")]
    Malformed(&'static str),
}

/// Bounds on what a single inbound frame may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_frame_bytes: usize,
    pub max_ops_per_message: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 10 * 1024 * 1024,
            max_ops_per_message: 100_000,
        }
    }
}

/// Decodes `bytes` and checks the result against `limits`.
pub fn decode_validated(
    bytes: &[u8],
    limits: &ValidationLimits,
) -> Result<WireMessage, ProtocolError> {
    if bytes.len() > limits.max_frame_bytes {
        return Err(ProtocolError::LimitExceeded {
            limit: limits.max_frame_bytes,
            actual: bytes.len(),
        });
    }
    let message = WireMessage::decode(bytes)?;
    let operations = message.operations();
    if operations.len() > limits.max_ops_per_message {
        return Err(ProtocolError::LimitExceeded {
            limit: limits.max_ops_per_message,
            actual: operations.len(),
        });
    }
    for op in operations {
        let id = op.id();
        if id.counter == 0 {
            return Err(ProtocolError::Malformed("zero counter"));
        }
        if op.prev >= id.counter {
            return Err(ProtocolError::Malformed("prev does not precede operation"));
        }
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OpId;
    use crate::replica::Payload;
    use crate::text::TextOp;

    fn insert(counter: u64, prev: u64) -> Operation {
        Operation {
            prev,
            payload: Payload::Text(TextOp::Insert {
                id: OpId::new(counter, 7),
                value: 'x',
                origin_left: None,
                origin_right: None,
            }),
        }
    }

    #[test]
    fn test_update_roundtrip() {
        let msg = WireMessage::update(7, vec![insert(1, 0), insert(2, 1)]);
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(WireMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = WireMessage::sync_step1(1, StateVector::new()).encode().unwrap();
        bytes[0] = 99;
        assert_eq!(
            WireMessage::decode(&bytes).unwrap_err(),
            ProtocolError::UnsupportedVersion(99)
        );
        assert_eq!(WireMessage::decode(&[]).unwrap_err(), ProtocolError::Empty);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = WireMessage::decode(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_limits_enforced() {
        let limits = ValidationLimits {
            max_frame_bytes: 1024,
            max_ops_per_message: 2,
        };
        let bytes = WireMessage::update(7, vec![insert(1, 0), insert(2, 1), insert(3, 2)])
            .encode()
            .unwrap();
        assert!(matches!(
            decode_validated(&bytes, &limits),
            Err(ProtocolError::LimitExceeded { limit: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_zero_counter_is_malformed() {
        let bytes = WireMessage::update(7, vec![insert(0, 0)]).encode().unwrap();
        assert_eq!(
            decode_validated(&bytes, &ValidationLimits::default()).unwrap_err(),
            ProtocolError::Malformed("zero counter")
        );
    }
}
