use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

/// Identifier of one live real-time connection.
pub type ConnectionId = Uuid;

/// Who is currently attached to which room.
///
/// Holds no persisted state and is never consulted for presence: a process
/// restart starts it empty and clients rebuild it by joining again.
pub trait RoomRegistry: Send + Sync {
    fn attach(&self, room_id: Uuid, conn_id: ConnectionId);

    fn detach(&self, room_id: Uuid, conn_id: ConnectionId);

    fn list_for(&self, room_id: Uuid) -> Vec<ConnectionId>;

    /// Rooms the connection is attached to.
    fn rooms_of(&self, conn_id: ConnectionId) -> Vec<Uuid>;

    /// Detach a connection from every room it is attached to.
    fn detach_all(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        let rooms = self.rooms_of(conn_id);
        for room_id in &rooms {
            self.detach(*room_id, conn_id);
        }
        rooms
    }
}

/// Process-local registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, HashSet<Uuid>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomRegistry for InMemoryRegistry {
    fn attach(&self, room_id: Uuid, conn_id: ConnectionId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.rooms.entry(room_id).or_default().insert(conn_id);
        state.connections.entry(conn_id).or_default().insert(room_id);
    }

    fn detach(&self, room_id: Uuid, conn_id: ConnectionId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(conns) = state.rooms.get_mut(&room_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                state.rooms.remove(&room_id);
            }
        }
        if let Some(rooms) = state.connections.get_mut(&conn_id) {
            rooms.remove(&room_id);
            if rooms.is_empty() {
                state.connections.remove(&conn_id);
            }
        }
    }

    fn list_for(&self, room_id: Uuid) -> Vec<ConnectionId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .rooms
            .get(&room_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    fn rooms_of(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .connections
            .get(&conn_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_detach_are_symmetric() {
        let registry = InMemoryRegistry::new();
        let room = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.attach(room, a);
        registry.attach(room, b);
        registry.attach(room, a);
        let mut listed = registry.list_for(room);
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);

        registry.detach(room, a);
        assert_eq!(registry.list_for(room), vec![b]);
        assert!(registry.rooms_of(a).is_empty());
    }

    #[test]
    fn detach_all_clears_every_room() {
        let registry = InMemoryRegistry::new();
        let conn = Uuid::new_v4();
        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        registry.attach(r1, conn);
        registry.attach(r2, conn);

        let mut rooms = registry.detach_all(conn);
        rooms.sort();
        let mut expected = vec![r1, r2];
        expected.sort();
        assert_eq!(rooms, expected);
        assert!(registry.list_for(r1).is_empty());
        assert!(registry.list_for(r2).is_empty());
    }
}
