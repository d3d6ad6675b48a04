use super::backoff::Backoff;
use super::link::{Connector, Link, TransportError};
use super::protocol::{MessageBody, WireMessage, decode_validated};
use super::ConnectionState;
use crate::awareness::AwarenessUpdate;
use crate::config::SessionConfig;
use crate::core::ReplicaId;
use crate::replica::Operation;
use crate::session::Shared;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug)]
pub(crate) enum Command {
    Broadcast(Vec<Operation>),
    Awareness(AwarenessUpdate),
    /// Ask the room for anything we are missing.
    Resync,
    Close,
}

enum LinkExit {
    Lost,
    Closed,
}

/// Background task owning the connection lifecycle of one session.
pub(crate) struct Driver<C> {
    room: String,
    local: ReplicaId,
    connector: Arc<C>,
    config: SessionConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    outbox: VecDeque<Operation>,
    backoff: Backoff,
    resync_pending: bool,
}

impl<C: Connector> Driver<C> {
    pub(crate) fn new(
        room: String,
        local: ReplicaId,
        connector: C,
        config: SessionConfig,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base(), config.backoff_max());
        Self {
            room,
            local,
            connector: Arc::new(connector),
            config,
            shared,
            commands,
            state,
            outbox: VecDeque::new(),
            backoff,
            resync_pending: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let connector = Arc::clone(&self.connector);
        let room = self.room.clone();
        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                result = connector.connect(&room) => Some(result),
                () = self.absorb_until_closed() => None,
            };
            let Some(result) = attempt else {
                break;
            };
            match result {
                Ok(link) => {
                    self.backoff.reset();
                    let exit = self.run_link(link).await;
                    let change = self.shared.lock().awareness_mut().clear_remote();
                    self.shared.publish_awareness(change);
                    if let LinkExit::Closed = exit {
                        break;
                    }
                    tracing::warn!(pending = self.outbox.len(), "link lost");
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt = self.backoff.attempts() + 1, "connect failed");
                }
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = self.backoff.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            let closed = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = self.absorb_until_closed() => true,
            };
            if closed {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(unsent = self.outbox.len(), "session closed");
    }

    /// Handles commands while no link is up. Returns once the session closes.
    async fn absorb_until_closed(&mut self) {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Close) => return,
                Some(Command::Broadcast(ops)) => self.buffer(ops),
                // Presence is re-announced on the next link.
                Some(Command::Awareness(_)) | Some(Command::Resync) => {}
            }
        }
    }

    async fn run_link(&mut self, link: Link) -> LinkExit {
        let Link {
            outbound,
            mut inbound,
        } = link;
        self.set_state(ConnectionState::Syncing);
        self.resync_pending = false;

        let (hello, presence) = {
            let mut replica = self.shared.lock();
            let hello = WireMessage::sync_step1(self.local, replica.state_vector().clone());
            (hello, replica.awareness_mut().heartbeat())
        };
        if self.send(&outbound, &hello).await.is_err()
            || self
                .send(&outbound, &WireMessage::awareness(self.local, presence))
                .await
                .is_err()
        {
            return LinkExit::Lost;
        }

        let sync_deadline = tokio::time::sleep(self.config.sync_timeout());
        tokio::pin!(sync_deadline);
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut malformed = 0u32;

        loop {
            let syncing = *self.state.borrow() == ConnectionState::Syncing;
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(bytes) = frame else {
                        return LinkExit::Lost;
                    };
                    match decode_validated(&bytes, &self.config.limits) {
                        Ok(message) => {
                            malformed = 0;
                            if self.handle(message, &outbound).await.is_err() {
                                return LinkExit::Lost;
                            }
                        }
                        Err(err) => {
                            malformed += 1;
                            tracing::warn!(error = %err, malformed, "dropping malformed frame");
                            if malformed >= self.config.max_malformed_messages {
                                tracing::error!(malformed, "too many malformed frames, dropping link");
                                return LinkExit::Lost;
                            }
                        }
                    }
                }
                command = self.commands.recv() => {
                    let sent = match command {
                        None | Some(Command::Close) => {
                            let farewell = self.shared.lock().awareness_mut().local_disconnect();
                            let _ = self
                                .send(&outbound, &WireMessage::awareness(self.local, farewell))
                                .await;
                            return LinkExit::Closed;
                        }
                        Some(Command::Broadcast(ops)) => {
                            let connected = self.state.borrow().is_connected();
                            if connected {
                                self.send(&outbound, &WireMessage::update(self.local, ops)).await
                            } else {
                                self.buffer(ops);
                                Ok(())
                            }
                        }
                        Some(Command::Awareness(update)) => {
                            self.send(&outbound, &WireMessage::awareness(self.local, update)).await
                        }
                        Some(Command::Resync) => self.request_resync(&outbound).await,
                    };
                    if sent.is_err() {
                        return LinkExit::Lost;
                    }
                }
                () = &mut sync_deadline, if syncing => {
                    tracing::debug!("no sync answer before timeout, assuming empty room");
                    if self.become_connected(&outbound).await.is_err() {
                        return LinkExit::Lost;
                    }
                }
                _ = heartbeat.tick() => {
                    let now = Instant::now().into_std();
                    let presence = {
                        let mut replica = self.shared.lock();
                        let expired = replica.awareness_mut().sweep_expired(now);
                        self.shared.publish_awareness(expired);
                        replica.awareness_mut().heartbeat()
                    };
                    self.resync_pending = false;
                    if self
                        .send(&outbound, &WireMessage::awareness(self.local, presence))
                        .await
                        .is_err()
                    {
                        return LinkExit::Lost;
                    }
                }
            }
        }
    }

    async fn handle(
        &mut self,
        message: WireMessage,
        outbound: &mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        if message.sender == self.local {
            return Ok(());
        }
        let sender = message.sender;
        match message.body {
            MessageBody::SyncStep1 { state_vector } => {
                let (missing, ours, behind) = {
                    let replica = self.shared.lock();
                    let ours = replica.state_vector().clone();
                    let behind = ours.is_behind(&state_vector);
                    (replica.ops_since(&state_vector), ours, behind)
                };
                tracing::debug!(peer = sender, operations = missing.len(), "answering sync request");
                self.send_step2(outbound, sender, missing).await?;
                if behind {
                    self.send(outbound, &WireMessage::sync_step1(self.local, ours))
                        .await?;
                }
            }
            MessageBody::SyncStep2 { target, operations } => {
                let outcome = self.shared.apply_remote(operations);
                if target == self.local {
                    self.resync_pending = false;
                    let syncing = *self.state.borrow() == ConnectionState::Syncing;
                    if syncing {
                        self.become_connected(outbound).await?;
                    }
                }
                if outcome.needs_resync {
                    self.request_resync(outbound).await?;
                }
            }
            MessageBody::Update { operations } => {
                let outcome = self.shared.apply_remote(operations);
                if outcome.rejected > 0 {
                    tracing::warn!(peer = sender, rejected = outcome.rejected, "peer sent invalid operations");
                }
                if outcome.needs_resync {
                    self.request_resync(outbound).await?;
                }
            }
            MessageBody::Awareness {
                participant,
                fields,
                timestamp,
            } => {
                self.shared
                    .apply_awareness(participant, fields, timestamp, Instant::now().into_std());
            }
        }
        Ok(())
    }

    async fn become_connected(
        &mut self,
        outbound: &mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connected);
        if self.outbox.is_empty() {
            return Ok(());
        }
        let pending: Vec<Operation> = self.outbox.drain(..).collect();
        tracing::info!(operations = pending.len(), "flushing offline edits");
        for chunk in pending.chunks(self.chunk_size()) {
            self.send(outbound, &WireMessage::update(self.local, chunk.to_vec()))
                .await?;
        }
        Ok(())
    }

    async fn request_resync(&mut self, outbound: &mpsc::Sender<Vec<u8>>) -> Result<(), TransportError> {
        if self.resync_pending {
            return Ok(());
        }
        self.resync_pending = true;
        let state_vector = self.shared.lock().state_vector().clone();
        tracing::debug!("requesting resync");
        self.send(outbound, &WireMessage::sync_step1(self.local, state_vector))
            .await
    }

    /// Sends `operations` as a `SyncStep2`, preceded by `Update` frames when
    /// they exceed one message.
    async fn send_step2(
        &self,
        outbound: &mpsc::Sender<Vec<u8>>,
        target: ReplicaId,
        operations: Vec<Operation>,
    ) -> Result<(), TransportError> {
        let mut chunks: Vec<Vec<Operation>> = operations
            .chunks(self.chunk_size())
            .map(<[Operation]>::to_vec)
            .collect();
        let last = chunks.pop().unwrap_or_default();
        for chunk in chunks {
            self.send(outbound, &WireMessage::update(self.local, chunk))
                .await?;
        }
        self.send(outbound, &WireMessage::sync_step2(self.local, target, last))
            .await
    }

    async fn send(
        &self,
        outbound: &mpsc::Sender<Vec<u8>>,
        message: &WireMessage,
    ) -> Result<(), TransportError> {
        let bytes = message.encode().map_err(|err| {
            tracing::error!(error = %err, "failed to encode message");
            TransportError::Io(err.to_string())
        })?;
        outbound
            .send(bytes)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn buffer(&mut self, ops: Vec<Operation>) {
        let before = self.outbox.len();
        self.outbox.extend(ops);
        let threshold = self.config.outbox_warn_threshold;
        if before <= threshold && self.outbox.len() > threshold {
            tracing::warn!(
                pending = self.outbox.len(),
                threshold,
                "offline outbox is growing"
            );
        }
    }

    fn chunk_size(&self) -> usize {
        self.config.limits.max_ops_per_message.max(1)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(state = ?next, "connection state changed");
        }
    }
}
