// Database row types. These map directly to SQLite rows.
// Distinct from sketch-types API models to keep the DB layer independent.
use anyhow::{Context, Result};
use uuid::Uuid;

use sketch_types::models::{Message, MessageKind, Room, Team};

use crate::from_millis;

pub struct UserRow {
    pub id: String,
    pub username: String,
}

pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub secret_key: String,
    pub owner_id: String,
    pub sketch_id: Option<String>,
    pub active: bool,
    pub created_at: i64,
}

impl RoomRow {
    pub fn into_room(self, co_owners: &[String]) -> Result<Room> {
        Ok(Room {
            id: parse_id(&self.id)?,
            name: self.name,
            owner_id: parse_id(&self.owner_id)?,
            co_owners: parse_ids(co_owners)?,
            sketch_id: self.sketch_id,
            active: self.active,
            created_at: from_millis(self.created_at),
        })
    }
}

pub struct RoomSummaryRow {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub created_at: i64,
    pub participant_count: u32,
}

pub struct ParticipantRow {
    pub room_id: String,
    pub user_id: String,
    pub active: bool,
    pub last_ping: i64,
    pub team_id: Option<String>,
    pub joined_at: i64,
}

/// Participant joined with its user, as listed in a room's member list.
pub struct MemberRow {
    pub user_id: String,
    pub username: String,
    pub active: bool,
    pub last_ping: i64,
    pub team_id: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub kind: String,
    pub llm_required: bool,
    pub created_at: i64,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            room_id: parse_id(&self.room_id)?,
            user_id: parse_id(&self.user_id)?,
            username: self.username,
            content: self.content,
            message_type: MessageKind::parse(&self.kind).unwrap_or_default(),
            llm_required: self.llm_required,
            timestamp: from_millis(self.created_at),
        })
    }
}

pub struct TeamRow {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl TeamRow {
    pub fn into_team(self) -> Result<Team> {
        Ok(Team {
            id: parse_id(&self.id)?,
            name: self.name,
            description: self.description,
        })
    }
}

pub struct AdminCredentialRow {
    pub key_hash: String,
    pub pending_key: Option<String>,
    pub acknowledged: bool,
}

pub fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("Corrupt id '{}'", raw))
}

pub fn parse_ids(raw: &[String]) -> Result<Vec<Uuid>> {
    raw.iter().map(|s| parse_id(s)).collect()
}
