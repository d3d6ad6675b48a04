//! Pluggable frame transport.
//!
//! A [`Connector`] opens a [`Link`] to a room: a pair of channels carrying
//! opaque binary frames. The session never sees sockets, only frames.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const LINK_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("link closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

/// An open connection to a room.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

impl Link {
    /// Two ends of a link, each seeing the other's outbound frames as inbound.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(LINK_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(LINK_CAPACITY);
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, room: &str) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

/// In-process relay: every frame a connection sends is delivered to every
/// other connection in the same room.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Debug, Default)]
struct RelayState {
    offline: bool,
    next_connection: u64,
    rooms: HashMap<String, HashMap<u64, mpsc::Sender<Vec<u8>>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes every open connection. Clients see their link drop and reconnect.
    pub fn drop_connections(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.rooms.clear();
        }
    }

    /// While offline, connection attempts fail and existing links are dropped.
    pub fn set_online(&self, online: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.offline = !online;
            if !online {
                state.rooms.clear();
            }
        }
    }

    pub fn connection_count(&self, room: &str) -> usize {
        self.inner
            .lock()
            .map(|state| state.rooms.get(room).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn register(&self, room: &str) -> Result<Link, TransportError> {
        let (client, relay_side) = Link::pair();
        let connection = {
            let mut state = self
                .inner
                .lock()
                .map_err(|_| TransportError::Io("relay state poisoned".into()))?;
            if state.offline {
                return Err(TransportError::Unreachable("memory relay offline".into()));
            }
            state.next_connection += 1;
            let connection = state.next_connection;
            state
                .rooms
                .entry(room.to_string())
                .or_default()
                .insert(connection, relay_side.outbound);
            connection
        };
        self.spawn_forwarder(room.to_string(), connection, relay_side.inbound);
        Ok(client)
    }

    fn spawn_forwarder(&self, room: String, connection: u64, mut frames: mpsc::Receiver<Vec<u8>>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let peers: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
                    let Ok(state) = inner.lock() else {
                        return;
                    };
                    let Some(members) = state.rooms.get(&room) else {
                        return;
                    };
                    if !members.contains_key(&connection) {
                        return;
                    }
                    members
                        .iter()
                        .filter(|(id, _)| **id != connection)
                        .map(|(id, tx)| (*id, tx.clone()))
                        .collect()
                };
                for (peer, tx) in peers {
                    if tx.send(frame.clone()).await.is_err() {
                        tracing::debug!(room = %room, peer, "relay peer gone");
                        if let Ok(mut state) = inner.lock()
                            && let Some(members) = state.rooms.get_mut(&room)
                        {
                            members.remove(&peer);
                        }
                    }
                }
            }
            if let Ok(mut state) = inner.lock()
                && let Some(members) = state.rooms.get_mut(&room)
            {
                members.remove(&connection);
            }
        });
    }
}

impl Connector for MemoryRelay {
    fn connect(&self, room: &str) -> impl Future<Output = Result<Link, TransportError>> + Send {
        async move { self.register(room) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_fans_out_to_other_members() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect("room").await.unwrap();
        let mut b = relay.connect("room").await.unwrap();
        let mut c = relay.connect("room").await.unwrap();
        let mut other = relay.connect("elsewhere").await.unwrap();

        a.outbound.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(b.inbound.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(c.inbound.recv().await.unwrap(), vec![1, 2, 3]);
        assert!(a.inbound.try_recv().is_err());
        assert!(other.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_relay_refuses_and_drops() {
        let relay = MemoryRelay::new();
        let mut link = relay.connect("room").await.unwrap();
        assert_eq!(relay.connection_count("room"), 1);

        relay.set_online(false);
        assert!(link.inbound.recv().await.is_none());
        assert!(matches!(
            relay.connect("room").await,
            Err(TransportError::Unreachable(_))
        ));

        relay.set_online(true);
        assert!(relay.connect("room").await.is_ok());
    }
}
