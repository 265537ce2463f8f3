//! Real-time side of the room service: connection registry, event fan-out,
//! presence tracking, session recovery and room lifecycle.

pub mod admin_key;
pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod presence;
pub mod recovery;
pub mod registry;
pub mod rooms;
pub mod store;

use std::sync::Arc;

pub use connection::handle_connection;

use admin_key::AdminKeyService;
use auth::ServiceCredential;
use dispatcher::Dispatcher;
use presence::{PresenceConfig, PresenceTracker};
use recovery::SessionRecovery;
use registry::InMemoryRegistry;
use rooms::RoomService;
use store::Store;

/// Everything a connection or request handler needs, cheap to clone.
#[derive(Clone)]
pub struct Hub {
    pub db: Store,
    pub dispatcher: Dispatcher,
    pub presence: PresenceTracker,
    pub recovery: SessionRecovery,
    pub rooms: RoomService,
    pub admin_keys: AdminKeyService,
    pub credential: ServiceCredential,
}

impl Hub {
    pub fn new(
        db: Store,
        credential: ServiceCredential,
        presence: PresenceConfig,
        message_history: u32,
    ) -> Self {
        let dispatcher = Dispatcher::new(Arc::new(InMemoryRegistry::new()));
        let presence = PresenceTracker::new(db.clone(), dispatcher.clone(), presence);
        let recovery = SessionRecovery::new(db.clone());
        let rooms = RoomService::new(
            db.clone(),
            dispatcher.clone(),
            presence.clone(),
            recovery.clone(),
            message_history,
        );
        Self {
            admin_keys: AdminKeyService::new(db.clone()),
            db,
            dispatcher,
            presence,
            recovery,
            rooms,
            credential,
        }
    }
}
