//! Full-state encoding of a [`TextDocument`].
//!
//! Items are written in document order with tombstones folded into
//! `(start, len)` runs. The sealed byte form carries a version and a crc32
//! checksum so a truncated or corrupted snapshot is refused instead of
//! half-loaded.

use super::{CharItem, TextDocument, TextError, TextOp};
use crate::core::{OpId, StateVector};
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedItem {
    pub id: OpId,
    pub value: char,
    pub origin_left: Option<OpId>,
    pub origin_right: Option<OpId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedState {
    pub state_vector: StateVector,
    pub items: Vec<EncodedItem>,
    /// Runs of deleted items as `(start, len)` over `items`.
    pub tombstones: Vec<(u32, u32)>,
    /// Delete operations as `(id, target)`.
    pub deletes: Vec<(OpId, OpId)>,
    /// Inserts still waiting on an origin.
    pub pending: Vec<TextOp>,
}

impl EncodedState {
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        seal(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        unseal(bytes)
    }

    pub fn visible_len(&self) -> usize {
        let deleted = self
            .tombstones
            .iter()
            .fold(0usize, |total, (_, len)| total.saturating_add(*len as usize));
        self.items.len().saturating_sub(deleted)
    }
}

#[derive(Serialize, Deserialize)]
struct Sealed {
    version: u32,
    checksum: u32,
    payload: Vec<u8>,
}

pub(crate) fn seal<T: Serialize>(value: &T) -> Result<Vec<u8>, SnapshotError> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SnapshotError::Encode(e.to_string()))?;
    let sealed = Sealed {
        version: VERSION,
        checksum: checksum_bytes(&payload),
        payload,
    };
    bincode::serde::encode_to_vec(&sealed, bincode::config::standard())
        .map_err(|e| SnapshotError::Encode(e.to_string()))
}

pub(crate) fn unseal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SnapshotError> {
    let (sealed, _): (Sealed, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SnapshotError::Decode(e.to_string()))?;
    if sealed.version != VERSION {
        return Err(SnapshotError::Corrupt("version"));
    }
    if checksum_bytes(&sealed.payload) != sealed.checksum {
        return Err(SnapshotError::Corrupt("checksum mismatch"));
    }
    let (value, _) = bincode::serde::decode_from_slice(&sealed.payload, bincode::config::standard())
        .map_err(|e| SnapshotError::Decode(e.to_string()))?;
    Ok(value)
}

fn checksum_bytes(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

impl TextDocument {
    pub fn snapshot(&self) -> EncodedState {
        let mut items = Vec::with_capacity(self.order.len());
        let mut tombstones: Vec<(u32, u32)> = Vec::new();
        for (index, item) in self.iter_all().enumerate() {
            if item.deleted {
                match tombstones.last_mut() {
                    Some((start, len)) if (*start + *len) as usize == index => *len += 1,
                    _ => tombstones.push((index as u32, 1)),
                }
            }
            items.push(EncodedItem {
                id: item.id,
                value: item.value,
                origin_left: item.origin_left,
                origin_right: item.origin_right,
            });
        }
        EncodedState {
            state_vector: self.state_vector(),
            items,
            tombstones,
            deletes: self.deletes.iter().map(|(id, target)| (*id, *target)).collect(),
            pending: self.pending_inserts.values().flatten().cloned().collect(),
        }
    }

    /// Loads `state` into this document.
    ///
    /// An empty document is rebuilt directly from the encoded order. A
    /// document that already holds operations merges the snapshot in as if
    /// each encoded operation had arrived from a peer.
    pub fn load_snapshot(&mut self, state: EncodedState) -> Result<(), SnapshotError> {
        let is_fresh = self.order.is_empty() && self.deletes.is_empty() && self.parked.is_empty();
        if is_fresh {
            self.rebuild_from(state)
        } else {
            self.merge_from(state)
        }
    }

    fn rebuild_from(&mut self, state: EncodedState) -> Result<(), SnapshotError> {
        let mut seen = HashSet::with_capacity(state.items.len());
        for item in &state.items {
            if !seen.insert(item.id) {
                return Err(SnapshotError::Corrupt("duplicate item id"));
            }
        }
        for item in &state.items {
            let dangling = [item.origin_left, item.origin_right]
                .into_iter()
                .flatten()
                .any(|origin| !seen.contains(&origin));
            if dangling {
                return Err(SnapshotError::Corrupt("dangling origin"));
            }
        }

        let mut rebuilt = TextDocument::new();
        for item in state.items {
            rebuilt.order.push(item.id);
            rebuilt.items.insert(
                item.id,
                CharItem {
                    id: item.id,
                    value: item.value,
                    origin_left: item.origin_left,
                    origin_right: item.origin_right,
                    deleted: false,
                },
            );
        }
        rebuilt.visible = rebuilt.order.len();
        for (start, len) in state.tombstones {
            let range = start as usize..(start as usize + len as usize);
            let Some(ids) = rebuilt.order.get(range) else {
                return Err(SnapshotError::Corrupt("tombstone range"));
            };
            for id in ids {
                if let Some(item) = rebuilt.items.get_mut(id)
                    && !item.deleted
                {
                    item.deleted = true;
                    rebuilt.visible -= 1;
                }
            }
        }
        for (id, target) in state.deletes {
            rebuilt.deletes.insert(id, target);
            if !rebuilt.items.contains_key(&target) {
                rebuilt.pending_deletes.entry(target).or_default().push(id);
            }
        }
        for op in state.pending {
            accept_parked(rebuilt.apply_remote(op))?;
        }
        *self = rebuilt;
        Ok(())
    }

    fn merge_from(&mut self, state: EncodedState) -> Result<(), SnapshotError> {
        let inserts = state.items.into_iter().map(|item| TextOp::Insert {
            id: item.id,
            value: item.value,
            origin_left: item.origin_left,
            origin_right: item.origin_right,
        });
        for op in inserts.chain(state.pending) {
            accept_parked(self.apply_remote(op))?;
        }
        for (id, target) in state.deletes {
            accept_parked(self.apply_remote(TextOp::Delete { id, target }))?;
        }
        Ok(())
    }
}

fn accept_parked<T>(result: Result<T, TextError>) -> Result<(), SnapshotError> {
    match result {
        Ok(_) | Err(TextError::UnresolvedDependency { .. }) => Ok(()),
        Err(_) => Err(SnapshotError::Corrupt("invalid operation")),
    }
}
