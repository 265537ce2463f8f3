use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use sketch_crypto::keys::{generate_secret_key, keys_match};
use sketch_db::models::{MessageRow, RoomRow, parse_id, parse_ids};
use sketch_db::queries::RoomWrite;
use sketch_db::{from_millis, to_millis};
use sketch_types::api::{CreateRoomRequest, CreateRoomResponse, RoomDetails, RoomSummary};
use sketch_types::events::{ServerEvent, validate_username};
use sketch_types::models::{Member, Message, MessageKind, Room};
use sketch_types::{SketchError, SketchResult};

use crate::dispatcher::Dispatcher;
use crate::presence::{PresenceTracker, load_members};
use crate::recovery::SessionRecovery;
use crate::registry::ConnectionId;
use crate::store::{Store, blocking};

/// Same message whether the room or the credential was wrong.
pub const INVALID_JOIN: &str = "Invalid room or secret key";
pub const ROOM_CLOSED: &str = "room is closed";

const MAX_ROOM_NAME_LEN: usize = 128;

fn invalid_join() -> SketchError {
    SketchError::not_found(INVALID_JOIN)
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: Uuid,
    pub username: String,
    pub secret_key: Option<String>,
    pub recovery_key: Option<String>,
    /// Honoured only with a valid secret key, and only on this user's first join to the room
    pub user_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub is_owner: bool,
}

#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub content: String,
    pub kind: MessageKind,
    pub llm_required: bool,
}

struct JoinSnapshot {
    room: Room,
    user_id: Uuid,
    username: String,
    members: Vec<Member>,
    messages: Vec<Message>,
}

/// Room lifecycle, ownership, joins and chat.
#[derive(Clone)]
pub struct RoomService {
    db: Store,
    dispatcher: Dispatcher,
    presence: PresenceTracker,
    recovery: SessionRecovery,
    message_history: u32,
    /// Held across a room-wide write and its broadcast so events leave in commit order
    ordered: Arc<Mutex<()>>,
}

impl RoomService {
    pub fn new(
        db: Store,
        dispatcher: Dispatcher,
        presence: PresenceTracker,
        recovery: SessionRecovery,
        message_history: u32,
    ) -> Self {
        Self {
            db,
            dispatcher,
            presence,
            recovery,
            message_history,
            ordered: Arc::new(Mutex::new(())),
        }
    }

    pub async fn create_room(&self, req: CreateRoomRequest) -> SketchResult<CreateRoomResponse> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(SketchError::validation("room name is required"));
        }
        if name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(SketchError::validation("room name is too long"));
        }
        let owner_name = match req.username {
            Some(username) => {
                validate_username(&username)?;
                Some(username.trim().to_string())
            }
            None => None,
        };

        let now = Utc::now();
        let row = RoomRow {
            id: Uuid::new_v4().to_string(),
            name,
            secret_key: generate_secret_key(),
            owner_id: req.user_id.to_string(),
            sketch_id: req.sketch_id,
            active: true,
            created_at: to_millis(now),
        };

        let row = blocking(&self.db, move |db| {
            match owner_name {
                Some(username) => db.upsert_user(&row.owner_id, &username, row.created_at)?,
                None => db.ensure_user(&row.owner_id, "owner", row.created_at)?,
            }
            db.create_room(&row)?;
            Ok(row)
        })
        .await?;

        let id = parse_id(&row.id).map_err(SketchError::store)?;
        info!("Room {} created by {}", id, req.user_id);
        Ok(CreateRoomResponse {
            id,
            name: row.name,
            secret_key: row.secret_key,
            owner_id: req.user_id,
            sketch_id: row.sketch_id,
            active: row.active,
            created_at: from_millis(row.created_at),
        })
    }

    /// Room with its co-owners and participant count. Never includes the secret.
    pub async fn get_room(&self, room_id: Uuid) -> SketchResult<RoomDetails> {
        let room = room_id.to_string();
        blocking(&self.db, move |db| {
            let Some(row) = db.get_room(&room)? else {
                return Ok(None);
            };
            let co_owners = db.co_owners(&room)?;
            let participant_count = db.participant_count(&room)?;
            let room = row.into_room(&co_owners)?;
            Ok(Some(RoomDetails {
                id: room.id,
                name: room.name,
                owner_id: room.owner_id,
                co_owners: room.co_owners,
                sketch_id: room.sketch_id,
                active: room.active,
                created_at: room.created_at,
                participant_count,
            }))
        })
        .await?
        .ok_or_else(|| SketchError::not_found("room not found"))
    }

    pub async fn list_rooms(&self) -> SketchResult<Vec<RoomSummary>> {
        blocking(&self.db, |db| {
            db.list_rooms()?
                .into_iter()
                .map(|row| -> anyhow::Result<RoomSummary> {
                    Ok(RoomSummary {
                        id: parse_id(&row.id)?,
                        name: row.name,
                        active: row.active,
                        created_at: from_millis(row.created_at),
                        participant_count: row.participant_count,
                    })
                })
                .collect()
        })
        .await
    }

    pub async fn members(&self, room_id: Uuid) -> SketchResult<Vec<Member>> {
        self.presence.members(room_id).await
    }

    /// `active = false` closes the room. `active = true` is accepted only
    /// while the room is still open, since closing is terminal.
    pub async fn set_room_status(
        &self,
        room_id: Uuid,
        requester: Uuid,
        active: bool,
    ) -> SketchResult<RoomDetails> {
        if active {
            let room = self.get_room(room_id).await?;
            if room.owner_id != requester {
                return Err(SketchError::forbidden("only the room owner can change its status"));
            }
            if !room.active {
                return Err(SketchError::conflict(ROOM_CLOSED));
            }
            return Ok(room);
        }
        self.close_room(room_id, requester).await?;
        self.get_room(room_id).await
    }

    /// Owner-only and irreversible. Returns false if the room was already closed.
    pub async fn close_room(&self, room_id: Uuid, requester: Uuid) -> SketchResult<bool> {
        let (room, requester_key) = (room_id.to_string(), requester.to_string());
        let (dispatcher, ordered) = (self.dispatcher.clone(), self.ordered.clone());
        let closed = blocking(&self.db, move |db| {
            let Some(row) = db.get_room(&room)? else {
                return Ok(Err(SketchError::not_found("room not found")));
            };
            if row.owner_id != requester_key {
                return Ok(Err(SketchError::forbidden("only the room owner can close the room")));
            }
            let _ordered = ordered.lock().unwrap_or_else(PoisonError::into_inner);
            let closed = db.close_room(&room)?;
            if closed {
                dispatcher.emit_to_room(room_id, ServerEvent::RoomClosed { room_id });
            }
            Ok(Ok(closed))
        })
        .await??;

        if closed {
            info!("Room {} closed by {}", room_id, requester);
        }
        Ok(closed)
    }

    pub async fn add_co_owner(&self, room_id: Uuid, requester: Uuid, user_id: Uuid) -> SketchResult<Vec<Uuid>> {
        self.change_co_owner(room_id, requester, user_id, true).await
    }

    pub async fn remove_co_owner(&self, room_id: Uuid, requester: Uuid, user_id: Uuid) -> SketchResult<Vec<Uuid>> {
        self.change_co_owner(room_id, requester, user_id, false).await
    }

    async fn change_co_owner(
        &self,
        room_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
        grant: bool,
    ) -> SketchResult<Vec<Uuid>> {
        let (room, requester_key, user) = (room_id.to_string(), requester.to_string(), user_id.to_string());
        let now_ms = to_millis(Utc::now());
        let (dispatcher, ordered) = (self.dispatcher.clone(), self.ordered.clone());
        let (changed, co_owners) = blocking(&self.db, move |db| {
            let Some(row) = db.get_room(&room)? else {
                return Ok(Err(SketchError::not_found("room not found")));
            };
            if row.owner_id != requester_key {
                return Ok(Err(SketchError::forbidden("only the room owner can manage co-owners")));
            }
            if grant {
                if user == row.owner_id {
                    return Ok(Err(SketchError::validation("the owner cannot be a co-owner")));
                }
                if db.get_participant(&room, &user)?.is_none() {
                    return Ok(Err(SketchError::not_found("user is not a participant of this room")));
                }
            }

            let _ordered = ordered.lock().unwrap_or_else(PoisonError::into_inner);
            let write = if grant {
                db.add_co_owner(&room, &user, now_ms)?
            } else {
                db.remove_co_owner(&room, &user)?
            };
            let changed = match write {
                RoomWrite::Applied => true,
                RoomWrite::Unchanged => false,
                RoomWrite::RoomClosed => return Ok(Err(SketchError::conflict(ROOM_CLOSED))),
                RoomWrite::Missing => return Ok(Err(SketchError::not_found("room not found"))),
            };
            let co_owners = parse_ids(&db.co_owners(&room)?)?;
            if changed {
                dispatcher.emit_to_room(
                    room_id,
                    ServerEvent::CoOwnerUpdated {
                        room_id,
                        user_id,
                        is_co_owner: grant,
                        co_owners: co_owners.clone(),
                    },
                );
            }
            Ok(Ok((changed, co_owners)))
        })
        .await??;

        if changed {
            info!(
                "Co-owner {} {} in room {}",
                user_id,
                if grant { "granted" } else { "revoked" },
                room_id
            );
        }
        Ok(co_owners)
    }

    /// Authenticate, upsert the participant, attach the connection, and send
    /// the room snapshot to the joiner and a join notice to everyone else.
    ///
    /// A recovery key, when present, takes precedence over the secret key and
    /// restores the stored identity.
    pub async fn join(&self, conn_id: ConnectionId, req: JoinRequest) -> SketchResult<JoinOutcome> {
        let username = req.username.trim().to_string();
        validate_username(&username)?;

        let room_id = req.room_id;
        let now = Utc::now();
        let away_after = self.presence.config().away_after;
        let history = self.message_history;
        let JoinRequest {
            secret_key,
            recovery_key,
            user_id: claimed_user,
            team_id,
            ..
        } = req;

        let snapshot = blocking(&self.db, move |db| {
            let room_key = room_id.to_string();
            let now_ms = to_millis(now);
            let Some(room) = db.get_room(&room_key)? else {
                return Ok(Err(invalid_join()));
            };

            let recovery_key = recovery_key.filter(|k| !k.trim().is_empty());
            let (user_id, username, rename) = match recovery_key {
                Some(key) => match db.find_by_recovery_key(&room_key, &key)? {
                    Some(user) => (user.id, user.username, false),
                    None => return Ok(Err(invalid_join())),
                },
                None => {
                    let secret = secret_key.unwrap_or_default();
                    if secret.is_empty() || !keys_match(&secret, &room.secret_key) {
                        return Ok(Err(invalid_join()));
                    }
                    match claimed_user {
                        // Known participants come back through their recovery key
                        Some(id) => {
                            let id = id.to_string();
                            if db.get_participant(&room_key, &id)?.is_some() {
                                return Ok(Err(invalid_join()));
                            }
                            (id, username, true)
                        }
                        None => match db.find_room_user_by_name(&room_key, &username)? {
                            Some(id) if id == room.owner_id => return Ok(Err(invalid_join())),
                            Some(id) => {
                                let stored = db.get_user(&id)?.map(|user| user.username);
                                (id, stored.unwrap_or(username), false)
                            }
                            None => (Uuid::new_v4().to_string(), username, true),
                        },
                    }
                }
            };

            if !room.active {
                return Ok(Err(SketchError::conflict(ROOM_CLOSED)));
            }
            let team = match team_id {
                Some(team) if db.team_exists(&team.to_string())? => Some(team.to_string()),
                Some(_) => return Ok(Err(SketchError::validation("unknown team"))),
                None => None,
            };
            if rename {
                db.upsert_user(&user_id, &username, now_ms)?;
            }
            match db.upsert_participant(&room_key, &user_id, team.as_deref(), now_ms)? {
                RoomWrite::Applied | RoomWrite::Unchanged => {}
                RoomWrite::RoomClosed => return Ok(Err(SketchError::conflict(ROOM_CLOSED))),
                RoomWrite::Missing => return Ok(Err(invalid_join())),
            }

            let co_owners = db.co_owners(&room_key)?;
            let members = load_members(db, &room_key, now, away_after)?.unwrap_or_default();
            let messages = db
                .recent_messages(&room_key, history)?
                .into_iter()
                .map(MessageRow::into_message)
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Ok(JoinSnapshot {
                room: room.into_room(&co_owners)?,
                user_id: parse_id(&user_id)?,
                username,
                members,
                messages,
            }))
        })
        .await??;

        let JoinSnapshot {
            room,
            user_id,
            username,
            members,
            messages,
        } = snapshot;
        let recovery_key = self.recovery.take_for_display(room_id, user_id).await?;
        let is_owner = room.is_owner(user_id);

        self.dispatcher.attach(room_id, conn_id);
        self.dispatcher.send_to(
            conn_id,
            ServerEvent::RoomJoined {
                room_id,
                messages,
                active_users: members.clone(),
                user_id,
                username: username.clone(),
                room_name: room.name,
                is_room_owner: is_owner,
                co_owners: room.co_owners,
                recovery_key,
                heartbeat_interval_secs: self.presence.config().heartbeat_interval.as_secs(),
            },
        );
        self.dispatcher.emit_to_room_except(
            room_id,
            conn_id,
            ServerEvent::UserJoined {
                room_id,
                user_id,
                username: username.clone(),
            },
        );
        self.dispatcher.emit_to_room_except(
            room_id,
            conn_id,
            ServerEvent::UpdateActiveUsers {
                room_id,
                active_users: members,
            },
        );

        info!("{} joined room {}", user_id, room_id);
        Ok(JoinOutcome {
            room_id,
            user_id,
            username,
            is_owner,
        })
    }

    /// Persist a message and broadcast it. Refused without broadcast once the room is closed.
    pub async fn send_message(&self, draft: MessageDraft) -> SketchResult<Message> {
        let room_id = draft.room_id;
        let (dispatcher, ordered) = (self.dispatcher.clone(), self.ordered.clone());
        let message = blocking(&self.db, move |db| {
            let user_key = draft.user_id.to_string();
            let username = db
                .get_user(&user_key)?
                .map(|user| user.username)
                .unwrap_or(draft.username);
            let _ordered = ordered.lock().unwrap_or_else(PoisonError::into_inner);
            let row = MessageRow {
                id: Uuid::new_v4().to_string(),
                room_id: draft.room_id.to_string(),
                user_id: user_key,
                username,
                content: draft.content,
                kind: draft.kind.as_str().to_string(),
                llm_required: draft.llm_required,
                created_at: to_millis(Utc::now()),
            };
            match db.insert_message(&row)? {
                RoomWrite::Applied | RoomWrite::Unchanged => {
                    let message = row.into_message()?;
                    dispatcher.emit_to_room(room_id, ServerEvent::NewMessage(message.clone()));
                    Ok(Ok(message))
                }
                RoomWrite::RoomClosed => Ok(Err(SketchError::conflict(ROOM_CLOSED))),
                RoomWrite::Missing => Ok(Err(SketchError::not_found("room not found"))),
            }
        })
        .await??;

        debug!("Message {} stored in room {}", message.id, room_id);
        Ok(message)
    }

    /// Existing and still open.
    pub async fn ensure_open(&self, room_id: Uuid) -> SketchResult<()> {
        let room = room_id.to_string();
        let active = blocking(&self.db, move |db| Ok(db.get_room(&room)?.map(|row| row.active))).await?;
        match active {
            Some(true) => Ok(()),
            Some(false) => Err(SketchError::conflict(ROOM_CLOSED)),
            None => Err(SketchError::not_found("room not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatcher::EventReceiver;
    use crate::testing::{TestRoom, drain, join_as, join_user, open_room, test_hub};
    use crate::Hub;

    fn join_request(room: &TestRoom, username: &str) -> JoinRequest {
        JoinRequest {
            room_id: room.id,
            username: username.into(),
            secret_key: Some(room.secret_key.clone()),
            recovery_key: None,
            user_id: None,
            team_id: None,
        }
    }

    fn draft(room: &TestRoom, user_id: Uuid, content: &str) -> MessageDraft {
        MessageDraft {
            room_id: room.id,
            user_id,
            username: "bob".into(),
            content: content.into(),
            kind: MessageKind::Plain,
            llm_required: false,
        }
    }

    fn room_joined(events: &[Arc<ServerEvent>]) -> Option<ServerEvent> {
        events
            .iter()
            .find(|ev| matches!(&***ev, ServerEvent::RoomJoined { .. }))
            .map(|ev| (**ev).clone())
    }

    fn watcher(hub: &Hub, room: &TestRoom) -> EventReceiver {
        let (conn, rx) = hub.dispatcher.register_connection();
        hub.dispatcher.attach(room.id, conn);
        rx
    }

    #[tokio::test]
    async fn created_room_is_open_and_owned() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let details = hub.rooms.get_room(room.id).await.unwrap();
        assert_eq!(details.owner_id, room.owner_id);
        assert!(details.active);
        assert_eq!(details.participant_count, 0);
        assert!(details.co_owners.is_empty());
        assert_eq!(hub.rooms.list_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_room_name_is_rejected() {
        let hub = test_hub();
        let err = hub
            .rooms
            .create_room(CreateRoomRequest {
                name: "  ".into(),
                user_id: Uuid::new_v4(),
                username: None,
                sketch_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SketchError::Validation(_)));
    }

    #[tokio::test]
    async fn join_sends_snapshot_and_notifies_the_room() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let mut others = watcher(&hub, &room);
        let (conn, mut rx) = hub.dispatcher.register_connection();

        let outcome = hub.rooms.join(conn, join_request(&room, "bob")).await.unwrap();
        assert!(!outcome.is_owner);
        assert!(hub.dispatcher.is_attached(room.id, conn));

        match room_joined(&drain(&mut rx)).unwrap() {
            ServerEvent::RoomJoined {
                user_id,
                active_users,
                recovery_key,
                is_room_owner,
                heartbeat_interval_secs,
                ..
            } => {
                assert_eq!(user_id, outcome.user_id);
                assert_eq!(active_users.len(), 1);
                assert!(recovery_key.is_some());
                assert!(!is_room_owner);
                assert_eq!(heartbeat_interval_secs, 5);
            }
            _ => unreachable!(),
        }

        let seen = drain(&mut others);
        assert!(matches!(&*seen[0], ServerEvent::UserJoined { username, .. } if username == "bob"));
        assert!(matches!(&*seen[1], ServerEvent::UpdateActiveUsers { .. }));
    }

    #[tokio::test]
    async fn wrong_secret_and_unknown_room_are_indistinguishable() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();

        let mut bad_secret = join_request(&room, "mallory");
        bad_secret.secret_key = Some("nope".into());
        let mut bad_room = join_request(&room, "mallory");
        bad_room.room_id = Uuid::new_v4();

        let a = hub.rooms.join(conn, bad_secret).await.unwrap_err();
        let b = hub.rooms.join(conn, bad_room).await.unwrap_err();
        assert_eq!(a, invalid_join());
        assert_eq!(a, b);
        assert!(!hub.dispatcher.is_attached(room.id, conn));
    }

    #[tokio::test]
    async fn rejoin_reuses_the_participant() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, mut rx) = hub.dispatcher.register_connection();

        let first = join_as(&hub, conn, &room, "bob").await;
        let second = join_as(&hub, conn, &room, "BOB").await;
        assert_eq!(first, second);
        assert_eq!(hub.rooms.get_room(room.id).await.unwrap().participant_count, 1);

        // Only the first snapshot carries the recovery key
        let keys: Vec<_> = drain(&mut rx)
            .iter()
            .filter_map(|ev| match &**ev {
                ServerEvent::RoomJoined { recovery_key, .. } => Some(recovery_key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].is_some());
        assert!(keys[1].is_none());
    }

    #[tokio::test]
    async fn recovery_key_rejoin_restores_identity_without_reissue() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, mut rx) = hub.dispatcher.register_connection();
        let alice = join_as(&hub, conn, &room, "alice").await;
        let issued = match room_joined(&drain(&mut rx)).unwrap() {
            ServerEvent::RoomJoined { recovery_key, .. } => recovery_key.unwrap(),
            _ => unreachable!(),
        };

        hub.dispatcher.unregister_connection(conn);
        hub.presence.leave(room.id, alice).await.unwrap();

        let (conn2, mut rx2) = hub.dispatcher.register_connection();
        let mut req = join_request(&room, "someone-else");
        req.secret_key = None;
        req.recovery_key = Some(issued.clone());
        let outcome = hub.rooms.join(conn2, req).await.unwrap();
        assert_eq!(outcome.user_id, alice);
        assert_eq!(outcome.username, "alice");

        match room_joined(&drain(&mut rx2)).unwrap() {
            ServerEvent::RoomJoined { recovery_key, .. } => assert!(recovery_key.is_none()),
            _ => unreachable!(),
        }
        assert!(hub.presence.observe_ping(room.id, alice).await.unwrap().is_some());
        assert_eq!(hub.recovery.issue_or_fetch(room.id, alice).await.unwrap(), issued);
    }

    #[tokio::test]
    async fn bad_recovery_key_fails_even_with_a_good_secret() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();
        let mut req = join_request(&room, "bob");
        req.recovery_key = Some("forged".into());
        assert_eq!(hub.rooms.join(conn, req).await.unwrap_err(), invalid_join());
    }

    #[tokio::test]
    async fn concurrent_co_owner_grants_yield_one_entry() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _conn_rx) = hub.dispatcher.register_connection();
        let carol = join_as(&hub, conn, &room, "carol").await;
        let mut rx = watcher(&hub, &room);

        let (a, b) = tokio::join!(
            hub.rooms.add_co_owner(room.id, room.owner_id, carol),
            hub.rooms.add_co_owner(room.id, room.owner_id, carol),
        );
        assert_eq!(a.unwrap(), vec![carol]);
        assert_eq!(b.unwrap(), vec![carol]);
        assert_eq!(hub.rooms.get_room(room.id).await.unwrap().co_owners, vec![carol]);

        let updates = drain(&mut rx)
            .iter()
            .filter(|ev| matches!(&***ev, ServerEvent::CoOwnerUpdated { .. }))
            .count();
        assert_eq!(updates, 1);

        assert!(hub.rooms.remove_co_owner(room.id, room.owner_id, carol).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_owner_manages_co_owners() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();
        let carol = join_as(&hub, conn, &room, "carol").await;
        let dave = join_as(&hub, conn, &room, "dave").await;

        let err = hub.rooms.add_co_owner(room.id, carol, dave).await.unwrap_err();
        assert!(matches!(err, SketchError::Forbidden(_)));
        let err = hub
            .rooms
            .add_co_owner(room.id, room.owner_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SketchError::NotFound(_)));
    }

    #[tokio::test]
    async fn non_owner_cannot_close() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();
        let bob = join_as(&hub, conn, &room, "bob").await;

        let err = hub.rooms.close_room(room.id, bob).await.unwrap_err();
        assert!(matches!(err, SketchError::Forbidden(_)));
        assert!(hub.rooms.get_room(room.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn close_is_broadcast_once_and_terminal() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let mut rx = watcher(&hub, &room);

        assert!(hub.rooms.close_room(room.id, room.owner_id).await.unwrap());
        assert!(!hub.rooms.close_room(room.id, room.owner_id).await.unwrap());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&*events[0], ServerEvent::RoomClosed { .. }));

        let err = hub
            .rooms
            .set_room_status(room.id, room.owner_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SketchError::Conflict(_)));

        let (conn, _conn_rx) = hub.dispatcher.register_connection();
        let err = hub.rooms.join(conn, join_request(&room, "late")).await.unwrap_err();
        assert!(matches!(err, SketchError::Conflict(_)));
        assert!(matches!(hub.rooms.ensure_open(room.id).await, Err(SketchError::Conflict(_))));
    }

    #[tokio::test]
    async fn closed_room_rejects_messages_without_broadcast() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, mut rx) = hub.dispatcher.register_connection();
        let bob = join_as(&hub, conn, &room, "bob").await;

        let sent = hub.rooms.send_message(draft(&room, bob, "first")).await.unwrap();
        assert_eq!(sent.username, "bob");
        hub.rooms.close_room(room.id, room.owner_id).await.unwrap();
        drain(&mut rx);

        let err = hub.rooms.send_message(draft(&room, bob, "too late")).await.unwrap_err();
        assert!(matches!(err, SketchError::Conflict(_)));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_messages_are_broadcast_in_store_order() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _conn_rx) = hub.dispatcher.register_connection();
        let bob = join_as(&hub, conn, &room, "bob").await;
        let mut rx = watcher(&hub, &room);

        let sends = (0..16).map(|i| {
            let rooms = hub.rooms.clone();
            let draft = draft(&room, bob, &format!("note {}", i));
            tokio::spawn(async move { rooms.send_message(draft).await })
        });
        for sent in futures_util::future::join_all(sends).await {
            sent.unwrap().unwrap();
        }

        let broadcast: Vec<String> = drain(&mut rx)
            .iter()
            .filter_map(|ev| match &**ev {
                ServerEvent::NewMessage(m) => Some(m.id.to_string()),
                _ => None,
            })
            .collect();
        let stored: Vec<String> = hub
            .db
            .recent_messages(&room.id.to_string(), 100)
            .unwrap()
            .into_iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(broadcast.len(), 16);
        assert_eq!(broadcast, stored);
    }

    #[tokio::test]
    async fn secret_join_cannot_take_over_a_known_participant() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (owner_conn, _owner_rx) = hub.dispatcher.register_connection();
        join_user(&hub, owner_conn, &room, "owner", Some(room.owner_id)).await;

        let (conn, _rx) = hub.dispatcher.register_connection();
        let mut req = join_request(&room, "mallory");
        req.user_id = Some(room.owner_id);
        assert_eq!(hub.rooms.join(conn, req).await.unwrap_err(), invalid_join());
        // Name reuse never resolves to the owner either
        let err = hub.rooms.join(conn, join_request(&room, "OWNER")).await.unwrap_err();
        assert_eq!(err, invalid_join());
        assert!(!hub.dispatcher.is_attached(room.id, conn));

        let members = hub.rooms.members(room.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, room.owner_id);
        assert_eq!(members[0].username, "owner");
    }

    #[tokio::test]
    async fn name_reuse_keeps_the_stored_display_name() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();
        let bob = join_as(&hub, conn, &room, "bob").await;

        let outcome = hub.rooms.join(conn, join_request(&room, "BOB")).await.unwrap();
        assert_eq!(outcome.user_id, bob);
        assert_eq!(outcome.username, "bob");
    }

    #[tokio::test]
    async fn co_owner_grant_after_close_is_refused() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _conn_rx) = hub.dispatcher.register_connection();
        let carol = join_as(&hub, conn, &room, "carol").await;
        let mut rx = watcher(&hub, &room);

        hub.rooms.close_room(room.id, room.owner_id).await.unwrap();
        let err = hub.rooms.add_co_owner(room.id, room.owner_id, carol).await.unwrap_err();
        assert!(matches!(err, SketchError::Conflict(_)));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&*events[0], ServerEvent::RoomClosed { .. }));
    }

    #[tokio::test]
    async fn snapshot_carries_recent_history() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();
        let bob = join_as(&hub, conn, &room, "bob").await;
        for text in ["one", "two", "three"] {
            hub.rooms.send_message(draft(&room, bob, text)).await.unwrap();
        }

        let (conn2, mut rx2) = hub.dispatcher.register_connection();
        join_user(&hub, conn2, &room, "owner", Some(room.owner_id)).await;
        match room_joined(&drain(&mut rx2)).unwrap() {
            ServerEvent::RoomJoined {
                messages,
                is_room_owner,
                ..
            } => {
                let texts: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(texts, vec!["one", "two", "three"]);
                assert!(is_room_owner);
            }
            _ => unreachable!(),
        }
    }
}
