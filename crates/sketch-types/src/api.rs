use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub name: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub sketch_id: Option<String>,
}

/// Returned once, to the creator. The only response that carries the secret key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub id: Uuid,
    pub name: String,
    pub secret_key: String,
    pub owner_id: Uuid,
    pub sketch_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub participant_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub co_owners: Vec<Uuid>,
    pub sketch_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub participant_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateRoomStatusRequest {
    pub user_id: Uuid,
    pub active: bool,
}

// -- Session recovery --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecoverSessionRequest {
    pub recovery_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverSessionResponse {
    pub user_id: Uuid,
    pub username: String,
    pub is_owner: bool,
    pub is_co_owner: bool,
}

// -- Co-owners --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddCoOwnerRequest {
    pub requester_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveCoOwnerQuery {
    pub requester_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoOwnersResponse {
    pub co_owners: Vec<Uuid>,
}

// -- Teams / admin --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTeamRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyAdminKeyRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyAdminKeyResponse {
    pub valid: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
}

/// Body of every 4xx/5xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
