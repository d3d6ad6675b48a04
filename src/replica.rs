//! One participant's replicated state and the operation log it serves to peers.
//!
//! A [`Replica`] owns the clock, the text document, the chat log and the
//! awareness table of one session. Every operation it emits or accepts is
//! wrapped in an [`Operation`] that names the issuing replica's previous
//! operation, so each source's stream is applied strictly in the order it
//! was generated even when frames arrive out of order or twice.

use crate::awareness::AwarenessTracker;
use crate::chat::{ChatEntry, ChatError, ChatLog, ChatMessage};
use crate::core::{CausalClock, OpId, ReplicaId, StateVector};
use crate::text::snapshot::{seal, unseal};
use crate::text::{EncodedState, SnapshotError, TextChange, TextDocument, TextError, TextOp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Text(TextOp),
    Chat(ChatEntry),
}

/// Unit of replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Counter of the issuer's previous operation, zero for its first.
    pub prev: u64,
    pub payload: Payload,
}

impl Operation {
    pub fn id(&self) -> OpId {
        match &self.payload {
            Payload::Text(op) => op.id(),
            Payload::Chat(entry) => entry.stamp,
        }
    }
}

/// What a batch of remote operations did to this replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub text_changes: Vec<TextChange>,
    pub chat_added: Vec<ChatEntry>,
    /// Operations accepted into the log.
    pub applied: usize,
    /// Operations refused as structurally invalid.
    pub rejected: usize,
    /// Something is missing: a gap in a source's stream or an unknown origin.
    pub needs_resync: bool,
}

impl ApplyOutcome {
    pub fn is_empty(&self) -> bool {
        self.text_changes.is_empty() && self.chat_added.is_empty() && self.applied == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplicaSnapshot {
    state_vector: StateVector,
    text: EncodedState,
    chat: Vec<ChatEntry>,
    /// `(id, prev)` for every logged operation.
    links: Vec<(OpId, u64)>,
}

#[derive(Debug)]
pub struct Replica {
    clock: CausalClock,
    text: TextDocument,
    chat: ChatLog,
    awareness: AwarenessTracker,
    log: BTreeMap<OpId, Operation>,
    last_emitted: u64,
    applied: StateVector,
    waiting: HashMap<ReplicaId, BTreeMap<u64, Operation>>,
}

impl Replica {
    pub fn new(id: ReplicaId, awareness_timeout: Duration) -> Self {
        Self {
            clock: CausalClock::new(id),
            text: TextDocument::new(),
            chat: ChatLog::new(),
            awareness: AwarenessTracker::new(id, awareness_timeout),
            log: BTreeMap::new(),
            last_emitted: 0,
            applied: StateVector::new(),
            waiting: HashMap::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.clock.replica()
    }

    pub fn text(&self) -> &TextDocument {
        &self.text
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut AwarenessTracker {
        &mut self.awareness
    }

    pub fn clock(&self) -> &CausalClock {
        &self.clock
    }

    /// Highest counter applied per source. Every operation of a source up to
    /// that counter is in the log.
    pub fn state_vector(&self) -> &StateVector {
        &self.applied
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Operations held back because an earlier one from the same source is
    /// still missing.
    pub fn waiting_count(&self) -> usize {
        self.waiting.values().map(BTreeMap::len).sum()
    }

    pub fn insert(&mut self, position: usize, text: &str) -> Result<Vec<Operation>, TextError> {
        if position > self.text.len() {
            return Err(TextError::PositionOutOfBounds {
                position,
                len: self.text.len(),
            });
        }
        let ops = self.text.insert_str(&mut self.clock, position, text)?;
        Ok(ops.into_iter().map(|op| self.emit(Payload::Text(op))).collect())
    }

    pub fn delete(&mut self, position: usize, len: usize) -> Result<Vec<Operation>, TextError> {
        let ops = self.text.delete_range(&mut self.clock, position, len)?;
        Ok(ops.into_iter().map(|op| self.emit(Payload::Text(op))).collect())
    }

    pub fn send_chat(
        &mut self,
        message: ChatMessage,
        wall_clock: u64,
    ) -> Result<(ChatEntry, Operation), ChatError> {
        let entry = self.chat.append(&mut self.clock, message, wall_clock)?;
        Ok((entry.clone(), self.emit(Payload::Chat(entry))))
    }

    /// Logged operations a peer with state vector `remote` has not applied,
    /// in id order.
    pub fn ops_since(&self, remote: &StateVector) -> Vec<Operation> {
        self.log
            .values()
            .filter(|op| !remote.contains(op.id()))
            .cloned()
            .collect()
    }

    pub fn apply_remote_ops(&mut self, ops: impl IntoIterator<Item = Operation>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for op in ops {
            let source = op.id().replica;
            if self.accept(op, &mut outcome) {
                self.drain_waiting(source, &mut outcome);
            }
        }
        if !self.waiting.is_empty() {
            outcome.needs_resync = true;
        }
        outcome
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let state = ReplicaSnapshot {
            state_vector: self.applied.clone(),
            text: self.text.snapshot(),
            chat: self.chat.entries().to_vec(),
            links: self.log.values().map(|op| (op.id(), op.prev)).collect(),
        };
        seal(&state)
    }

    /// Restores or merges a snapshot produced by [`Replica::snapshot`].
    pub fn load_snapshot(&mut self, bytes: &[u8]) -> Result<ApplyOutcome, SnapshotError> {
        let state: ReplicaSnapshot = unseal(bytes)?;
        let links: HashMap<OpId, u64> = state.links.iter().copied().collect();

        if !self.log.is_empty() {
            let text_ops = state
                .text
                .items
                .iter()
                .map(|item| TextOp::Insert {
                    id: item.id,
                    value: item.value,
                    origin_left: item.origin_left,
                    origin_right: item.origin_right,
                })
                .chain(state.text.pending.iter().cloned())
                .chain(
                    state
                        .text
                        .deletes
                        .iter()
                        .map(|(id, target)| TextOp::Delete {
                            id: *id,
                            target: *target,
                        }),
                )
                .map(Payload::Text);
            let mut ops: Vec<Operation> = text_ops
                .chain(state.chat.into_iter().map(Payload::Chat))
                .map(|payload| link(payload, &links))
                .collect();
            ops.sort_by_key(Operation::id);
            return Ok(self.apply_remote_ops(ops));
        }

        let mut text = TextDocument::new();
        text.load_snapshot(state.text)?;
        let mut chat = ChatLog::new();
        chat.merge(state.chat);

        let mut log = BTreeMap::new();
        for op in text.ops() {
            let op = link(Payload::Text(op), &links);
            log.insert(op.id(), op);
        }
        for entry in chat.entries() {
            let op = link(Payload::Chat(entry.clone()), &links);
            log.insert(op.id(), op);
        }
        if log.keys().any(|id| !links.contains_key(id)) {
            return Err(SnapshotError::Corrupt("operation without link"));
        }

        self.clock.advance_to(&state.state_vector);
        self.last_emitted = state.state_vector.counter(self.id());
        self.applied = state.state_vector;
        self.text = text;
        self.chat = chat;
        self.log = log;
        self.waiting.clear();
        tracing::debug!(
            replica = self.id(),
            operations = self.log.len(),
            "loaded snapshot"
        );
        Ok(ApplyOutcome {
            applied: self.log.len(),
            ..ApplyOutcome::default()
        })
    }

    fn emit(&mut self, payload: Payload) -> Operation {
        let op = Operation {
            prev: self.last_emitted,
            payload,
        };
        let id = op.id();
        self.last_emitted = id.counter;
        self.applied.observe(id);
        self.log.insert(id, op.clone());
        op
    }

    /// Applies `op` if it is next in its source's stream. Returns whether the
    /// source advanced.
    fn accept(&mut self, op: Operation, outcome: &mut ApplyOutcome) -> bool {
        let id = op.id();
        let applied = self.applied.counter(id.replica);
        if id.counter <= applied || self.log.contains_key(&id) {
            return false;
        }
        if op.prev > applied {
            tracing::debug!(%id, prev = op.prev, applied, "holding operation until its predecessor arrives");
            self.waiting
                .entry(id.replica)
                .or_default()
                .insert(op.prev, op);
            outcome.needs_resync = true;
            return false;
        }

        self.applied.observe(id);
        self.clock.observe(id);
        let accepted = match &op.payload {
            Payload::Text(text_op) => match self.text.apply_remote(text_op.clone()) {
                Ok(effect) => {
                    outcome.text_changes.extend(effect.changes);
                    true
                }
                Err(TextError::UnresolvedDependency { missing, .. }) => {
                    tracing::debug!(%id, %missing, "parked insert with unknown origin");
                    outcome.needs_resync = true;
                    true
                }
                Err(err) => {
                    tracing::warn!(%id, error = %err, "rejected remote operation");
                    false
                }
            },
            Payload::Chat(entry) => {
                if self.chat.merge([entry.clone()]) > 0 {
                    outcome.chat_added.push(entry.clone());
                }
                true
            }
        };
        // Rejected operations stay in the log so the source's chain has no hole
        // when it is re-served to other peers.
        self.log.insert(id, op);
        if accepted {
            outcome.applied += 1;
        } else {
            outcome.rejected += 1;
        }
        true
    }

    fn drain_waiting(&mut self, source: ReplicaId, outcome: &mut ApplyOutcome) {
        loop {
            let applied = self.applied.counter(source);
            let Some(queue) = self.waiting.get_mut(&source) else {
                return;
            };
            let ready = queue
                .first_key_value()
                .is_some_and(|(prev, _)| *prev <= applied);
            let next = if ready { queue.pop_first() } else { None };
            if queue.is_empty() {
                self.waiting.remove(&source);
            }
            let Some((_, op)) = next else {
                return;
            };
            self.accept(op, outcome);
        }
    }
}

fn link(payload: Payload, links: &HashMap<OpId, u64>) -> Operation {
    let id = match &payload {
        Payload::Text(op) => op.id(),
        Payload::Chat(entry) => entry.stamp,
    };
    Operation {
        prev: links.get(&id).copied().unwrap_or(0),
        payload,
    }
}
