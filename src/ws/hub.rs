//! Connected clients and fan-out
//!
//! Each connection owns an unbounded queue drained by its socket writer
//! task. Rooms only ever talk to clients through the `Transport` trait.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::ServerEnvelope;

/// Outbound side of the client transport, as seen by rooms
pub trait Transport: Send + Sync {
    fn send_to(&self, client: &str, message: &ServerEnvelope);

    /// Send to every client currently in `room_id`
    fn broadcast(&self, room_id: &str, message: &ServerEnvelope);
}

struct Connection {
    tx: mpsc::UnboundedSender<String>,
    room: Option<String>,
}

/// Registry of live WebSocket connections
#[derive(Default)]
pub struct Hub {
    clients: DashMap<String, Connection>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client name. Fails if the name is already connected.
    pub fn register(&self, client: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        let entry = self.clients.entry(client.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(_) = entry {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        entry.or_insert(Connection { tx, room: None });
        Some(rx)
    }

    /// Drop a client; returns the room it was in
    pub fn unregister(&self, client: &str) -> Option<String> {
        self.clients.remove(client).and_then(|(_, conn)| conn.room)
    }

    /// Move a client to a room; returns the room it was in before
    pub fn set_room(&self, client: &str, room: Option<String>) -> Option<String> {
        let mut conn = self.clients.get_mut(client)?;
        std::mem::replace(&mut conn.room, room)
    }

    pub fn room_of(&self, client: &str) -> Option<String> {
        self.clients.get(client).and_then(|conn| conn.room.clone())
    }

    pub fn connected(&self) -> usize {
        self.clients.len()
    }
}

fn encode(message: &ServerEnvelope) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(event = %message.event, error = %e, "Failed to encode message");
            None
        }
    }
}

impl Transport for Hub {
    fn send_to(&self, client: &str, message: &ServerEnvelope) {
        let Some(conn) = self.clients.get(client) else {
            debug!(client_id = %client, event = %message.event, "Dropping message for unknown client");
            return;
        };
        if let Some(json) = encode(message) {
            let _ = conn.tx.send(json);
        }
    }

    fn broadcast(&self, room_id: &str, message: &ServerEnvelope) {
        let Some(json) = encode(message) else {
            return;
        };
        for conn in self.clients.iter() {
            if conn.room.as_deref() == Some(room_id) {
                let _ = conn.tx.send(json.clone());
            }
        }
    }
}
