use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use sketch_types::events::ServerEvent;

use crate::registry::{ConnectionId, RoomRegistry};

pub type EventReceiver = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Fans events out to the connections attached to a room.
///
/// Delivery is best-effort: a connection that is going away simply misses the
/// event. Each connection has its own ordered queue, so events emitted for a
/// room in completion order reach every attached connection in that order.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<dyn RoomRegistry>,

    /// Per-connection outbound queues: conn_id -> sender
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Arc<ServerEvent>>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn RoomRegistry>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new connection. Returns (conn_id, receiver).
    pub fn register_connection(&self) -> (ConnectionId, EventReceiver) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Drop the connection's queue and detach it from every room.
    /// Returns the rooms it was attached to.
    pub fn unregister_connection(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id);
        self.inner.registry.detach_all(conn_id)
    }

    pub fn attach(&self, room_id: Uuid, conn_id: ConnectionId) {
        self.inner.registry.attach(room_id, conn_id);
    }

    pub fn detach(&self, room_id: Uuid, conn_id: ConnectionId) {
        self.inner.registry.detach(room_id, conn_id);
    }

    pub fn is_attached(&self, room_id: Uuid, conn_id: ConnectionId) -> bool {
        self.inner.registry.list_for(room_id).contains(&conn_id)
    }

    /// Send an event to one connection. Returns false if it is gone.
    pub fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        let connections = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get(&conn_id) {
            Some(tx) => tx.send(Arc::new(event)).is_ok(),
            None => false,
        }
    }

    /// Deliver an event to every connection attached to the room.
    /// Returns how many connections accepted it.
    pub fn emit_to_room(&self, room_id: Uuid, event: ServerEvent) -> usize {
        self.emit(room_id, None, event)
    }

    /// Same as `emit_to_room`, skipping one connection.
    pub fn emit_to_room_except(&self, room_id: Uuid, except: ConnectionId, event: ServerEvent) -> usize {
        self.emit(room_id, Some(except), event)
    }

    fn emit(&self, room_id: Uuid, except: Option<ConnectionId>, event: ServerEvent) -> usize {
        let targets = self.inner.registry.list_for(room_id);
        if targets.is_empty() {
            return 0;
        }

        let event = Arc::new(event);
        let connections = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        for conn_id in targets {
            if Some(conn_id) == except {
                continue;
            }
            if let Some(tx) = connections.get(&conn_id) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!("Room {} event delivered to {} connections", room_id, delivered);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    fn closed(room_id: Uuid) -> ServerEvent {
        ServerEvent::RoomClosed { room_id }
    }

    #[test]
    fn emit_reaches_only_attached_connections() {
        let dispatcher = Dispatcher::new(Arc::new(InMemoryRegistry::new()));
        let room = Uuid::new_v4();
        let (a, mut rx_a) = dispatcher.register_connection();
        let (_b, mut rx_b) = dispatcher.register_connection();
        dispatcher.attach(room, a);

        assert_eq!(dispatcher.emit_to_room(room, closed(room)), 1);
        assert!(matches!(*rx_a.try_recv().unwrap(), ServerEvent::RoomClosed { .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn emit_except_skips_the_origin() {
        let dispatcher = Dispatcher::new(Arc::new(InMemoryRegistry::new()));
        let room = Uuid::new_v4();
        let (a, mut rx_a) = dispatcher.register_connection();
        let (b, mut rx_b) = dispatcher.register_connection();
        dispatcher.attach(room, a);
        dispatcher.attach(room, b);

        assert_eq!(dispatcher.emit_to_room_except(room, a, closed(room)), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn unregistered_connection_is_detached_and_silent() {
        let dispatcher = Dispatcher::new(Arc::new(InMemoryRegistry::new()));
        let room = Uuid::new_v4();
        let (a, _rx) = dispatcher.register_connection();
        dispatcher.attach(room, a);

        assert_eq!(dispatcher.unregister_connection(a), vec![room]);
        assert!(!dispatcher.is_attached(room, a));
        assert!(!dispatcher.send_to(a, closed(room)));
        assert_eq!(dispatcher.emit_to_room(room, closed(room)), 0);
    }

    #[test]
    fn per_connection_order_is_preserved() {
        let dispatcher = Dispatcher::new(Arc::new(InMemoryRegistry::new()));
        let room = Uuid::new_v4();
        let (a, mut rx) = dispatcher.register_connection();
        dispatcher.attach(room, a);

        for i in 0..10 {
            dispatcher.emit_to_room(
                room,
                ServerEvent::Error {
                    message: i.to_string(),
                },
            );
        }
        for i in 0..10 {
            match &*rx.try_recv().unwrap() {
                ServerEvent::Error { message } => assert_eq!(message, &i.to_string()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
