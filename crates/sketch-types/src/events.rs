use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SketchError;
use crate::models::{Member, Message, MessageKind};

pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_MESSAGE_LEN: usize = 16 * 1024;

/// Events sent FROM server TO client over the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Snapshot sent to the joining connection only
    RoomJoined {
        room_id: Uuid,
        messages: Vec<Message>,
        active_users: Vec<Member>,
        user_id: Uuid,
        username: String,
        room_name: String,
        is_room_owner: bool,
        co_owners: Vec<Uuid>,
        /// Present only the first time the credential is handed out
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recovery_key: Option<String>,
        heartbeat_interval_secs: u64,
    },

    NewMessage(Message),

    UserJoined {
        room_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// Explicit leave, followed by a fresh member list
    UserLeft {
        room_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// Full member list for a room
    UpdateActiveUsers {
        room_id: Uuid,
        active_users: Vec<Member>,
    },

    /// Single-participant presence refresh
    UserStatusUpdate { room_id: Uuid, user: Member },

    CoOwnerUpdated {
        room_id: Uuid,
        user_id: Uuid,
        is_co_owner: bool,
        co_owners: Vec<Uuid>,
    },

    /// Terminal: the room accepts nothing further
    RoomClosed { room_id: Uuid },

    /// One-time, process-wide admin credential handout
    InitialAdminKey { admin_key: String },

    Error { message: String },
}

impl ServerEvent {
    /// Returns the room this event is scoped to, if any.
    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            Self::RoomJoined { room_id, .. }
            | Self::UserJoined { room_id, .. }
            | Self::UserLeft { room_id, .. }
            | Self::UpdateActiveUsers { room_id, .. }
            | Self::UserStatusUpdate { room_id, .. }
            | Self::CoOwnerUpdated { room_id, .. }
            | Self::RoomClosed { room_id } => Some(*room_id),
            Self::NewMessage(msg) => Some(msg.room_id),
            Self::InitialAdminKey { .. } | Self::Error { .. } => None,
        }
    }

    pub fn error(err: &SketchError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

/// Events sent FROM client TO server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Full join: authenticates against the room secret or a recovery credential
    JoinRoom {
        #[serde(alias = "room")]
        room_id: Uuid,
        username: String,
        #[serde(default)]
        secret_key: Option<String>,
        #[serde(default)]
        recovery_key: Option<String>,
        #[serde(default)]
        user_id: Option<Uuid>,
        /// Accepted for compatibility; ownership always comes from the store
        #[serde(default)]
        is_owner: Option<bool>,
        #[serde(default)]
        team: Option<Uuid>,
    },

    KeepAlive {
        #[serde(alias = "room")]
        room_id: Uuid,
        user_id: Uuid,
    },

    SendMessage {
        #[serde(alias = "room")]
        room_id: Uuid,
        username: String,
        content: String,
        user_id: Uuid,
        #[serde(default)]
        message_type: MessageKind,
        #[serde(default, rename = "llm_required", alias = "llmRequired")]
        llm_required: bool,
    },

    /// Attach for fan-out without a full join
    JoinSocketRoom {
        #[serde(alias = "room")]
        room_id: Uuid,
    },

    LeaveRoom {
        #[serde(alias = "room")]
        room_id: Uuid,
        user_id: Uuid,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::KeepAlive { .. } => "keep_alive",
            Self::SendMessage { .. } => "send_message",
            Self::JoinSocketRoom { .. } => "join_socket_room",
            Self::LeaveRoom { .. } => "leave_room",
        }
    }

    pub fn room_id(&self) -> Uuid {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::KeepAlive { room_id, .. }
            | Self::SendMessage { room_id, .. }
            | Self::JoinSocketRoom { room_id }
            | Self::LeaveRoom { room_id, .. } => *room_id,
        }
    }

    /// The acting user for events that act on behalf of a joined participant.
    pub fn acting_user(&self) -> Option<Uuid> {
        match self {
            Self::KeepAlive { user_id, .. }
            | Self::SendMessage { user_id, .. }
            | Self::LeaveRoom { user_id, .. } => Some(*user_id),
            Self::JoinRoom { .. } | Self::JoinSocketRoom { .. } => None,
        }
    }

    /// Field-level checks that don't need the store.
    pub fn validate(&self) -> Result<(), SketchError> {
        match self {
            Self::JoinRoom {
                username,
                secret_key,
                recovery_key,
                ..
            } => {
                validate_username(username)?;
                let has_secret = secret_key.as_deref().is_some_and(|s| !s.is_empty());
                let has_recovery = recovery_key.as_deref().is_some_and(|s| !s.is_empty());
                if !has_secret && !has_recovery {
                    return Err(SketchError::validation(
                        "secretKey or recoveryKey is required",
                    ));
                }
                Ok(())
            }
            Self::SendMessage {
                username, content, ..
            } => {
                validate_username(username)?;
                if content.trim().is_empty() {
                    return Err(SketchError::validation("message content is empty"));
                }
                if content.len() > MAX_MESSAGE_LEN {
                    return Err(SketchError::validation("message content is too long"));
                }
                Ok(())
            }
            Self::KeepAlive { .. } | Self::JoinSocketRoom { .. } | Self::LeaveRoom { .. } => Ok(()),
        }
    }
}

pub fn validate_username(username: &str) -> Result<(), SketchError> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(SketchError::validation("username is required"));
    }
    if trimmed.chars().count() > MAX_USERNAME_LEN {
        return Err(SketchError::validation("username is too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_accepts_short_room_field() {
        let room = Uuid::new_v4();
        let raw = json!({
            "event": "join_room",
            "data": { "room": room, "username": "alice", "secretKey": "abc" }
        });
        let ev: ClientEvent = serde_json::from_value(raw).unwrap();
        match ev {
            ClientEvent::JoinRoom {
                room_id,
                username,
                secret_key,
                user_id,
                ..
            } => {
                assert_eq!(room_id, room);
                assert_eq!(username, "alice");
                assert_eq!(secret_key.as_deref(), Some("abc"));
                assert!(user_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn send_message_keeps_snake_case_llm_flag() {
        let raw = json!({
            "event": "send_message",
            "data": {
                "roomId": Uuid::new_v4(),
                "username": "bob",
                "content": "ioc: 10.0.0.1",
                "userId": Uuid::new_v4(),
                "messageType": "command",
                "llm_required": true
            }
        });
        let ev: ClientEvent = serde_json::from_value(raw).unwrap();
        match ev {
            ClientEvent::SendMessage {
                message_type,
                llm_required,
                ..
            } => {
                assert_eq!(message_type, MessageKind::Command);
                assert!(llm_required);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let raw = json!({ "event": "drop_tables", "data": {} });
        assert!(serde_json::from_value::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn join_requires_a_credential() {
        let ev = ClientEvent::JoinRoom {
            room_id: Uuid::new_v4(),
            username: "carol".into(),
            secret_key: Some(String::new()),
            recovery_key: None,
            user_id: None,
            is_owner: Some(true),
            team: None,
        };
        assert!(matches!(ev.validate(), Err(SketchError::Validation(_))));
    }

    #[test]
    fn blank_message_is_invalid() {
        let ev = ClientEvent::SendMessage {
            room_id: Uuid::new_v4(),
            username: "dave".into(),
            content: "   ".into(),
            user_id: Uuid::new_v4(),
            message_type: MessageKind::Plain,
            llm_required: false,
        };
        assert!(matches!(ev.validate(), Err(SketchError::Validation(_))));
    }

    #[test]
    fn room_joined_omits_recovery_key_after_first_display() {
        let ev = ServerEvent::RoomJoined {
            room_id: Uuid::new_v4(),
            messages: vec![],
            active_users: vec![],
            user_id: Uuid::new_v4(),
            username: "erin".into(),
            room_name: "incident-42".into(),
            is_room_owner: false,
            co_owners: vec![],
            recovery_key: None,
            heartbeat_interval_secs: 5,
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["event"], "room_joined");
        assert_eq!(value["data"]["roomName"], "incident-42");
        assert!(value["data"].get("recoveryKey").is_none());
    }

    #[test]
    fn room_closed_is_scoped_to_its_room() {
        let room_id = Uuid::new_v4();
        let ev = ServerEvent::RoomClosed { room_id };
        assert_eq!(ev.room_id(), Some(room_id));
        assert_eq!(
            ServerEvent::InitialAdminKey {
                admin_key: "k".into()
            }
            .room_id(),
            None
        );
    }
}
