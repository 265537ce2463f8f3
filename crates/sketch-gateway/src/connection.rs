use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sketch_types::events::{ClientEvent, ServerEvent};
use sketch_types::{SketchError, SketchResult};

use crate::Hub;
use crate::registry::ConnectionId;
use crate::rooms::{JoinRequest, MessageDraft};

/// Server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long queued events (e.g. a final error) may take to flush on close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// (room, user) pairs this connection has joined.
type Bindings = Arc<Mutex<HashSet<(Uuid, Uuid)>>>;

/// Drive one pre-authenticated WebSocket connection until it closes.
///
/// The service credential was checked at the HTTP upgrade. Inside the
/// connection, events acting for a user must name a (room, user) pair this
/// connection joined; anything else is an auth failure and closes it.
pub async fn handle_connection(socket: WebSocket, hub: Hub) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut events) = hub.dispatcher.register_connection();
    info!("Connection {} opened", conn_id);

    match hub.admin_keys.take_initial_key().await {
        Ok(Some(admin_key)) => {
            info!("Initial admin key handed to connection {}", conn_id);
            hub.dispatcher
                .send_to(conn_id, ServerEvent::InitialAdminKey { admin_key });
        }
        Ok(None) => {}
        Err(e) => warn!("Admin key lookup failed: {}", e),
    }

    let bindings: Bindings = Arc::new(Mutex::new(HashSet::new()));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Queue -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    let text = match serde_json::to_string(&*event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping unserializable event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client -> handlers
    let recv_hub = hub.clone();
    let recv_bindings = bindings.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let Err(e) = handle_event(&recv_hub, conn_id, &recv_bindings, text.as_str()).await else {
                        continue;
                    };
                    recv_hub.dispatcher.send_to(conn_id, ServerEvent::error(&e));
                    if e.is_terminal() {
                        warn!("Closing connection {}: {}", conn_id, e);
                        break;
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {}
    }

    // Dropping the queue lets the send task flush what is left, then close
    hub.dispatcher.unregister_connection(conn_id);
    if !send_task.is_finished() && tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    let joined: Vec<(Uuid, Uuid)> = bindings
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (room_id, user_id) in joined {
        if let Err(e) = hub.presence.on_disconnect(room_id, user_id).await {
            warn!("Could not start grace window for {} in room {}: {}", user_id, room_id, e);
        }
    }

    info!("Connection {} closed", conn_id);
}

/// Parse, validate, authorize and run one inbound event.
pub async fn handle_event(
    hub: &Hub,
    conn_id: ConnectionId,
    bindings: &Mutex<HashSet<(Uuid, Uuid)>>,
    text: &str,
) -> SketchResult<()> {
    let event: ClientEvent = serde_json::from_str(text).map_err(|e| {
        warn!(
            "Connection {} bad event: {} -- raw: {}",
            conn_id,
            e,
            text.chars().take(200).collect::<String>()
        );
        SketchError::validation(format!("malformed event: {}", e))
    })?;
    event.validate()?;

    if let Some(user_id) = event.acting_user() {
        let bound = bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(event.room_id(), user_id));
        if !bound {
            warn!(
                "Connection {} sent {} for room {} without joining it",
                conn_id,
                event.name(),
                event.room_id()
            );
            return Err(SketchError::Auth);
        }
    }
    debug!("Connection {} -> {}", conn_id, event.name());

    match event {
        ClientEvent::JoinRoom {
            room_id,
            username,
            secret_key,
            recovery_key,
            user_id,
            team,
            // Ownership is always read from the store
            is_owner: _,
        } => {
            let outcome = hub
                .rooms
                .join(
                    conn_id,
                    JoinRequest {
                        room_id,
                        username,
                        secret_key,
                        recovery_key,
                        user_id,
                        team_id: team,
                    },
                )
                .await?;
            bindings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((outcome.room_id, outcome.user_id));
        }

        ClientEvent::KeepAlive { room_id, user_id } => {
            hub.presence.record_heartbeat(room_id, user_id).await?;
        }

        ClientEvent::SendMessage {
            room_id,
            username,
            content,
            user_id,
            message_type,
            llm_required,
        } => {
            hub.rooms
                .send_message(MessageDraft {
                    room_id,
                    user_id,
                    username,
                    content,
                    kind: message_type,
                    llm_required,
                })
                .await?;
        }

        ClientEvent::JoinSocketRoom { room_id } => {
            hub.rooms.ensure_open(room_id).await?;
            hub.dispatcher.attach(room_id, conn_id);
        }

        ClientEvent::LeaveRoom { room_id, user_id } => {
            let still_in_room = {
                let mut bound = bindings.lock().unwrap_or_else(PoisonError::into_inner);
                bound.remove(&(room_id, user_id));
                bound.iter().any(|(room, _)| *room == room_id)
            };
            if !still_in_room {
                hub.dispatcher.detach(room_id, conn_id);
            }
            hub.presence.leave(room_id, user_id).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{TestRoom, drain, open_room, test_hub};

    fn join_text(room: &TestRoom, username: &str) -> String {
        json!({
            "event": "join_room",
            "data": { "room": room.id, "username": username, "secretKey": room.secret_key }
        })
        .to_string()
    }

    fn keep_alive_text(room_id: Uuid, user_id: Uuid) -> String {
        json!({ "event": "keep_alive", "data": { "room": room_id, "userId": user_id } }).to_string()
    }

    #[tokio::test]
    async fn keep_alive_before_join_is_terminal() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();
        let bindings = Mutex::new(HashSet::new());

        let err = handle_event(&hub, conn, &bindings, &keep_alive_text(room.id, room.owner_id))
            .await
            .unwrap_err();
        assert_eq!(err, SketchError::Auth);
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn malformed_event_is_a_recoverable_validation_error() {
        let hub = test_hub();
        let (conn, _rx) = hub.dispatcher.register_connection();
        let bindings = Mutex::new(HashSet::new());

        let err = handle_event(&hub, conn, &bindings, "{\"event\":\"join_room\"")
            .await
            .unwrap_err();
        assert!(matches!(err, SketchError::Validation(_)));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn joined_session_may_heartbeat_and_chat_until_it_leaves() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, mut rx) = hub.dispatcher.register_connection();
        let bindings = Mutex::new(HashSet::new());

        handle_event(&hub, conn, &bindings, &join_text(&room, "bob")).await.unwrap();
        let user_id = match &*drain(&mut rx)[0] {
            ServerEvent::RoomJoined { user_id, .. } => *user_id,
            other => panic!("unexpected {:?}", other),
        };

        handle_event(&hub, conn, &bindings, &keep_alive_text(room.id, user_id))
            .await
            .unwrap();
        let message = json!({
            "event": "send_message",
            "data": {
                "room": room.id,
                "username": "bob",
                "content": "hash matches known loader",
                "userId": user_id,
                "messageType": "plain",
                "llm_required": false
            }
        })
        .to_string();
        handle_event(&hub, conn, &bindings, &message).await.unwrap();
        let delivered = drain(&mut rx);
        assert!(delivered
            .iter()
            .any(|ev| matches!(&**ev, ServerEvent::NewMessage(m) if m.user_id == user_id)));

        let leave = json!({ "event": "leave_room", "data": { "room": room.id, "userId": user_id } }).to_string();
        handle_event(&hub, conn, &bindings, &leave).await.unwrap();
        assert!(!hub.dispatcher.is_attached(room.id, conn));
        let err = handle_event(&hub, conn, &bindings, &keep_alive_text(room.id, user_id))
            .await
            .unwrap_err();
        assert_eq!(err, SketchError::Auth);
    }

    #[tokio::test]
    async fn socket_room_attach_requires_an_open_room() {
        let hub = test_hub();
        let room = open_room(&hub).await;
        let (conn, _rx) = hub.dispatcher.register_connection();
        let bindings = Mutex::new(HashSet::new());
        let attach = json!({ "event": "join_socket_room", "data": { "room": room.id } }).to_string();

        handle_event(&hub, conn, &bindings, &attach).await.unwrap();
        assert!(hub.dispatcher.is_attached(room.id, conn));

        hub.rooms.close_room(room.id, room.owner_id).await.unwrap();
        let (late, _late_rx) = hub.dispatcher.register_connection();
        let err = handle_event(&hub, late, &bindings, &attach).await.unwrap_err();
        assert!(matches!(err, SketchError::Conflict(_)));
    }
}
