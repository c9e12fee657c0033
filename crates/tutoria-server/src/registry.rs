use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;

use tutoria_core::ConnectionId;
use tutoria_telemetry::metrics::WS_BROADCAST_DROPS_TOTAL;

/// Frames queued for one socket's writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a close frame with this reason, then stop writing.
    Close(String),
}

/// Live sockets on this server, keyed by connection id.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, mpsc::Sender<Outbound>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a socket and return the receiving end of its send queue.
    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        self.connections.insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: &ConnectionId) {
        self.connections.remove(id);
    }

    pub fn is_live(&self, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Queue a frame for one socket. Drops the frame if its queue is full.
    pub fn send_to(&self, id: &ConnectionId, frame: Outbound) -> bool {
        let Some(tx) = self.connections.get(id).map(|entry| entry.value().clone()) else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                tracing::warn!(connection = %id, "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver `text` to each listed id with a live socket here. Returns how many
    /// were queued; ids without a socket are skipped.
    pub fn broadcast(&self, ids: &[ConnectionId], text: &str) -> usize {
        ids.iter()
            .filter(|id| self.send_to(id, Outbound::Text(text.to_string())))
            .count()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}
