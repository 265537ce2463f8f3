use uuid::Uuid;

use sketch_crypto::keys::generate_recovery_key;
use sketch_db::models::parse_id;
use sketch_types::{SketchError, SketchResult};

use crate::store::{Store, blocking};

/// Same message for an unknown room and a wrong credential.
pub const INVALID_RECOVERY: &str = "Invalid room or recovery key";

/// Identity bound to a recovery credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredSession {
    pub user_id: Uuid,
    pub username: String,
    pub is_owner: bool,
    pub is_co_owner: bool,
}

/// Issues one opaque credential per participant and resolves it back to a user.
#[derive(Clone)]
pub struct SessionRecovery {
    db: Store,
}

impl SessionRecovery {
    pub fn new(db: Store) -> Self {
        Self { db }
    }

    /// Stored credential for the participant, generating one only if none exists yet.
    pub async fn issue_or_fetch(&self, room_id: Uuid, user_id: Uuid) -> SketchResult<String> {
        let (room, user) = (room_id.to_string(), user_id.to_string());
        let candidate = generate_recovery_key();
        blocking(&self.db, move |db| db.issue_recovery_key(&room, &user, &candidate))
            .await?
            .ok_or_else(|| SketchError::not_found("participant not found"))
    }

    /// The credential, but only to the first caller. Every later call gets `None`.
    pub async fn take_for_display(&self, room_id: Uuid, user_id: Uuid) -> SketchResult<Option<String>> {
        let (room, user) = (room_id.to_string(), user_id.to_string());
        let candidate = generate_recovery_key();
        blocking(&self.db, move |db| {
            let Some(key) = db.issue_recovery_key(&room, &user, &candidate)? else {
                return Ok(None);
            };
            if db.claim_recovery_display(&room, &user)? {
                Ok(Some(key))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Resolve a credential to its user. Does not touch presence.
    pub async fn recover(&self, room_id: Uuid, recovery_key: &str) -> SketchResult<RecoveredSession> {
        if recovery_key.trim().is_empty() {
            return Err(SketchError::not_found(INVALID_RECOVERY));
        }
        let room = room_id.to_string();
        let key = recovery_key.to_string();
        let session = blocking(&self.db, move |db| {
            let Some(room_row) = db.get_room(&room)? else {
                return Ok(None);
            };
            let Some(user) = db.find_by_recovery_key(&room, &key)? else {
                return Ok(None);
            };
            let co_owners = db.co_owners(&room)?;
            Ok(Some(RecoveredSession {
                user_id: parse_id(&user.id)?,
                is_owner: user.id == room_row.owner_id,
                is_co_owner: co_owners.contains(&user.id),
                username: user.username,
            }))
        })
        .await?;
        session.ok_or_else(|| SketchError::not_found(INVALID_RECOVERY))
    }
}
