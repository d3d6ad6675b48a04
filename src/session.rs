//! A live collaboration session in one room.
//!
//! The [`Session`] owns the local [`Replica`] behind a mutex and a background
//! task that keeps it in sync with the room. Every mutation, local or
//! remote, goes through the same lock, and change events are published
//! while it is held so subscribers observe changes in the order they were
//! applied.

use crate::awareness::{AwarenessChange, CURSOR, FieldValue, Fields};
use crate::chat::{ChatEntry, ChatError, ChatMessage};
use crate::config::{ConfigError, SessionConfig};
use crate::core::{ReplicaId, random_replica_id, unix_millis};
use crate::identity::Participant;
use crate::replica::{ApplyOutcome, Operation, Replica};
use crate::sync::transport::{Command, Driver};
use crate::sync::{ConnectionState, Connector};
use crate::text::{SnapshotError, TextChange, TextError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Text(#[from] TextError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    /// The document was replaced wholesale; consumers should re-read it.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEvent {
    pub origin: ChangeOrigin,
    pub changes: Vec<TextChange>,
}

pub(crate) struct Shared {
    replica: Mutex<Replica>,
    text_events: broadcast::Sender<TextEvent>,
    chat_events: broadcast::Sender<ChatEntry>,
    awareness_events: broadcast::Sender<AwarenessChange>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Replica> {
        self.replica.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn apply_remote(&self, ops: Vec<Operation>) -> ApplyOutcome {
        let mut replica = self.lock();
        let outcome = replica.apply_remote_ops(ops);
        self.publish(ChangeOrigin::Remote, &outcome);
        outcome
    }

    pub(crate) fn apply_awareness(
        &self,
        participant: ReplicaId,
        fields: Option<Fields>,
        timestamp: u64,
        now: Instant,
    ) {
        let mut replica = self.lock();
        let change = replica
            .awareness_mut()
            .apply_remote(participant, fields, timestamp, now);
        self.publish_awareness(change);
    }

    pub(crate) fn publish_awareness(&self, change: AwarenessChange) {
        if !change.is_empty() {
            let _ = self.awareness_events.send(change);
        }
    }

    fn publish(&self, origin: ChangeOrigin, outcome: &ApplyOutcome) {
        if !outcome.text_changes.is_empty() {
            let _ = self.text_events.send(TextEvent {
                origin,
                changes: outcome.text_changes.clone(),
            });
        }
        for entry in &outcome.chat_added {
            let _ = self.chat_events.send(entry.clone());
        }
    }
}

pub struct Session {
    room: String,
    id: ReplicaId,
    participant: Participant,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Joins `room` with a fresh replica id and a random display identity.
    /// Must be called from within a tokio runtime.
    pub fn join<C: Connector>(
        room: impl Into<String>,
        connector: C,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        Self::join_as(
            room,
            connector,
            config,
            random_replica_id(),
            Participant::random(),
        )
    }

    pub fn join_as<C: Connector>(
        room: impl Into<String>,
        connector: C,
        config: SessionConfig,
        id: ReplicaId,
        participant: Participant,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let room = room.into();
        let mut replica = Replica::new(id, config.awareness_timeout());
        replica.awareness_mut().set_local(participant.fields());

        let shared = Arc::new(Shared {
            replica: Mutex::new(replica),
            text_events: broadcast::channel(config.event_capacity).0,
            chat_events: broadcast::channel(config.event_capacity).0,
            awareness_events: broadcast::channel(config.event_capacity).0,
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let span = tracing::info_span!("session", room = %room, replica = id);
        let driver = Driver::new(
            room.clone(),
            id,
            connector,
            config,
            Arc::clone(&shared),
            command_rx,
            state_tx,
        );
        let task = tokio::spawn(driver.run().instrument(span));
        tracing::info!(room = %room, replica = id, name = %participant.name, "joined room");

        Ok(Self {
            room,
            id,
            participant,
            shared,
            commands,
            state,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn text(&self) -> String {
        self.shared.lock().text().visible_text()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().text().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, position: usize, text: &str) -> Result<(), SessionError> {
        let mut replica = self.shared.lock();
        self.insert_locked(&mut replica, position, text)
    }

    pub fn delete(&self, position: usize, len: usize) -> Result<(), SessionError> {
        let mut replica = self.shared.lock();
        self.delete_locked(&mut replica, position, len)
    }

    /// Removes `len` characters at `position` and inserts `text` there as one
    /// step. No remote change lands between the two.
    pub fn replace(&self, position: usize, len: usize, text: &str) -> Result<(), SessionError> {
        let mut replica = self.shared.lock();
        self.delete_locked(&mut replica, position, len)?;
        self.insert_locked(&mut replica, position, text)
    }

    fn insert_locked(
        &self,
        replica: &mut Replica,
        position: usize,
        text: &str,
    ) -> Result<(), SessionError> {
        if text.is_empty() {
            return Ok(());
        }
        let ops = replica.insert(position, text)?;
        let changes = text
            .chars()
            .enumerate()
            .map(|(offset, value)| TextChange::Inserted {
                index: position + offset,
                value,
            })
            .collect();
        let _ = self.shared.text_events.send(TextEvent {
            origin: ChangeOrigin::Local,
            changes,
        });
        self.broadcast(ops);
        Ok(())
    }

    fn delete_locked(
        &self,
        replica: &mut Replica,
        position: usize,
        len: usize,
    ) -> Result<(), SessionError> {
        if len == 0 {
            return Ok(());
        }
        let removed: Vec<char> = replica
            .text()
            .visible_items()
            .skip(position)
            .take(len)
            .map(|item| item.value)
            .collect();
        let ops = replica.delete(position, len)?;
        let changes = removed
            .into_iter()
            .map(|value| TextChange::Deleted {
                index: position,
                value,
            })
            .collect();
        let _ = self.shared.text_events.send(TextEvent {
            origin: ChangeOrigin::Local,
            changes,
        });
        self.broadcast(ops);
        Ok(())
    }

    /// Posts a chat message under this session's participant identity.
    pub fn send_chat(&self, text: &str) -> Result<ChatEntry, SessionError> {
        let message = ChatMessage::new(&self.participant.name, &self.participant.color, text);
        let mut replica = self.shared.lock();
        let (entry, op) = replica.send_chat(message, unix_millis())?;
        let _ = self.shared.chat_events.send(entry.clone());
        self.broadcast(vec![op]);
        Ok(entry)
    }

    pub fn chat_entries(&self) -> Vec<ChatEntry> {
        self.shared.lock().chat().entries().to_vec()
    }

    pub fn set_awareness_field(&self, key: &str, value: impl Into<FieldValue>) {
        let update = {
            let mut replica = self.shared.lock();
            replica.awareness_mut().set_local_field(key, value);
            replica.awareness_mut().take_dirty()
        };
        if let Some(update) = update {
            let _ = self.commands.send(Command::Awareness(update));
        }
    }

    pub fn set_cursor(&self, position: usize) {
        self.set_awareness_field(CURSOR, position as i64);
    }

    /// Every known participant's awareness fields, local first.
    pub fn awareness_states(&self) -> Vec<(ReplicaId, Fields)> {
        self.shared.lock().awareness().states()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_text(&self) -> broadcast::Receiver<TextEvent> {
        self.shared.text_events.subscribe()
    }

    /// The current text together with a receiver for every change after it.
    pub fn subscribe_text_from_now(&self) -> (String, broadcast::Receiver<TextEvent>) {
        let replica = self.shared.lock();
        (replica.text().visible_text(), self.shared.text_events.subscribe())
    }

    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatEntry> {
        self.shared.chat_events.subscribe()
    }

    pub fn subscribe_awareness(&self) -> broadcast::Receiver<AwarenessChange> {
        self.shared.awareness_events.subscribe()
    }

    /// Waits until the connection reaches `target`.
    pub async fn wait_for(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, SessionError> {
        Ok(self.shared.lock().snapshot()?)
    }

    /// Loads a snapshot. Operations it adds reach peers through the next
    /// state exchange.
    pub fn load_snapshot(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut replica = self.shared.lock();
        let was_empty = replica.log_len() == 0;
        let outcome = replica.load_snapshot(bytes)?;
        if was_empty {
            let _ = self.shared.text_events.send(TextEvent {
                origin: ChangeOrigin::Snapshot,
                changes: Vec::new(),
            });
            for entry in replica.chat().entries() {
                let _ = self.shared.chat_events.send(entry.clone());
            }
        } else {
            self.shared.publish(ChangeOrigin::Remote, &outcome);
        }
        let _ = self.commands.send(Command::Resync);
        Ok(())
    }

    /// Leaves the room: announces departure when a link is up and stops the
    /// background task. The local document stays readable.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            tracing::error!(room = %self.room, error = %err, "session task failed");
        }
    }

    fn broadcast(&self, ops: Vec<Operation>) {
        if !ops.is_empty() {
            let _ = self.commands.send(Command::Broadcast(ops));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("room", &self.room)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
