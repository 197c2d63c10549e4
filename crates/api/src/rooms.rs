//! Connection and room registry for the realtime transport.
//!
//! One registry exists per server process and is shared by reference with every
//! handler. All membership changes and fan-outs take the same lock, so each
//! room sees broadcasts in the order they were issued.

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use tradedesk_core::ServerEvent;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Default)]
struct Registry {
    /// Outbound queue of every live connection.
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    /// Room name -> members.
    rooms: HashMap<String, HashSet<ConnectionId>>,
    /// Connection -> rooms it joined, for cleanup on disconnect.
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl Registry {
    fn deliver(&self, id: &ConnectionId, event: &ServerEvent) -> bool {
        match self.connections.get(id) {
            Some(tx) => tx.send(event.clone()).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<Registry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and hand back the receiving end of its outbound queue.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.connections.insert(id, tx);
        inner.memberships.insert(id, HashSet::new());
        (id, rx)
    }

    /// Drop a connection and every room membership it held.
    /// Returns the rooms it was still in.
    pub async fn disconnect(&self, id: ConnectionId) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&id);
        let rooms: Vec<String> = inner
            .memberships
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for room in &rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        rooms
    }

    /// Add a connection to a room. Joining twice is a no-op; returns whether
    /// membership changed.
    pub async fn join(&self, id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(joined) = inner.memberships.get_mut(&id) else {
            debug!(conn = %id, room, "Join from unknown connection ignored");
            return false;
        };
        if !joined.insert(room.to_string()) {
            return false;
        }
        inner.rooms.entry(room.to_string()).or_default().insert(id);
        true
    }

    /// Remove a connection from a room. Leaving a room not joined is a no-op.
    pub async fn leave(&self, id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .memberships
            .get_mut(&id)
            .map(|joined| joined.remove(room))
            .unwrap_or(false);
        if removed {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        removed
    }

    pub async fn is_member(&self, id: ConnectionId, room: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .rooms
            .get(room)
            .map(|members| members.contains(&id))
            .unwrap_or(false)
    }

    pub async fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut rooms: Vec<String> = inner
            .memberships
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub async fn member_count(&self, room: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.rooms.get(room).map(HashSet::len).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Deliver to a single connection.
    pub async fn emit(&self, id: ConnectionId, event: ServerEvent) -> bool {
        self.inner.lock().await.deliver(&id, &event)
    }

    /// Deliver to every member of a room. Returns how many received it.
    pub async fn broadcast_to_room(&self, room: &str, event: ServerEvent) -> usize {
        self.fan_out(room, None, event).await
    }

    /// Deliver to every member of a room except `sender`.
    pub async fn broadcast_to_room_except(
        &self,
        room: &str,
        sender: ConnectionId,
        event: ServerEvent,
    ) -> usize {
        self.fan_out(room, Some(sender), event).await
    }

    /// Deliver to every live connection.
    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        let inner = self.inner.lock().await;
        inner
            .connections
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    async fn fan_out(&self, room: &str, skip: Option<ConnectionId>, event: ServerEvent) -> usize {
        let inner = self.inner.lock().await;
        let Some(members) = inner.rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| Some(**id) != skip)
            .filter(|id| inner.deliver(id, &event))
            .count()
    }
}
