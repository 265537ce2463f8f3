use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An investigation room. `active` flips to false exactly once, when the owner closes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub co_owners: Vec<Uuid>,
    pub sketch_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_owner(&self, user_id: Uuid) -> bool {
        self.owner_id == user_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

/// Display status derived from the persisted `active` flag and the age of the last ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Away,
    Inactive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Plain,
    System,
    Command,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::System => "system",
            Self::Command => "command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(Self::Plain),
            "system" => Some(Self::System),
            "command" => Some(Self::Command),
            _ => None,
        }
    }
}

/// Messages are immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub content: String,
    pub message_type: MessageKind,
    pub llm_required: bool,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a room's member list as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: Uuid,
    pub username: String,
    pub status: PresenceStatus,
    pub last_ping: DateTime<Utc>,
    pub team_id: Option<Uuid>,
    pub is_owner: bool,
    pub is_co_owner: bool,
}
