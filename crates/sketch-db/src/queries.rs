use std::collections::BTreeSet;

use crate::Database;
use crate::models::{
    AdminCredentialRow, MemberRow, MessageRow, ParticipantRow, RoomRow, RoomSummaryRow, TeamRow,
    UserRow,
};
use anyhow::Result;
use rusqlite::{Connection, params};

/// Outcome of a write that is refused once the room is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomWrite {
    Applied,
    /// Room is open but the row was already in the requested state
    Unchanged,
    RoomClosed,
    Missing,
}

impl Database {
    // -- Users --

    /// Insert or rename a user. Last write wins on the display name.
    pub fn upsert_user(&self, id: &str, username: &str, now_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                params![id, username, now_ms],
            )?;
            Ok(())
        })
    }

    /// Insert a user only if it does not exist yet.
    pub fn ensure_user(&self, id: &str, username: &str, now_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
                params![id, username, now_ms],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Case-insensitive lookup of a user already participating in a room.
    pub fn find_room_user_by_name(&self, room_id: &str, username: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT u.id FROM users u
                 JOIN participants p ON p.user_id = u.id
                 WHERE p.room_id = ?1 AND LOWER(u.username) = LOWER(?2)
                 ORDER BY p.last_ping DESC
                 LIMIT 1",
                params![room_id, username],
                |row| row.get(0),
            )
            .optional()
        })
    }

    // -- Rooms --

    pub fn create_room(&self, room: &RoomRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (id, name, secret_key, owner_id, sketch_id, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    room.id,
                    room.name,
                    room.secret_key,
                    room.owner_id,
                    room.sketch_id,
                    room.active,
                    room.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_room(&self, id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    /// All rooms, newest first, with their participant counts.
    pub fn list_rooms(&self) -> Result<Vec<RoomSummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.name, r.active, r.created_at, COUNT(p.user_id)
                 FROM rooms r
                 LEFT JOIN participants p ON p.room_id = r.id
                 GROUP BY r.id
                 ORDER BY r.created_at DESC, r.rowid DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RoomSummaryRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        active: row.get(2)?,
                        created_at: row.get(3)?,
                        participant_count: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn participant_count(&self, room_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM participants WHERE room_id = ?1",
                [room_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Flip `active` to false and deactivate every participant in one
    /// transaction. Returns false if the room was already closed.
    pub fn close_room(&self, room_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE rooms SET active = 0 WHERE id = ?1 AND active = 1",
                [room_id],
            )?;
            if changed == 1 {
                tx.execute(
                    "UPDATE participants SET active = 0 WHERE room_id = ?1 AND active = 1",
                    [room_id],
                )?;
            }
            tx.commit()?;
            Ok(changed == 1)
        })
    }

    // -- Co-owners --

    /// Co-owner ids in grant order.
    pub fn co_owners(&self, room_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| query_co_owners(conn, room_id))
    }

    /// Set union on the co-owner table. Refused once the room is closed.
    pub fn add_co_owner(&self, room_id: &str, user_id: &str, now_ms: i64) -> Result<RoomWrite> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO room_co_owners (room_id, user_id, granted_at)
                 SELECT ?1, ?2, ?3
                 WHERE EXISTS (SELECT 1 FROM rooms WHERE id = ?1 AND active = 1)",
                params![room_id, user_id, now_ms],
            )?;
            if changed == 1 {
                return Ok(RoomWrite::Applied);
            }
            unchanged_or_refusal(conn, room_id)
        })
    }

    pub fn remove_co_owner(&self, room_id: &str, user_id: &str) -> Result<RoomWrite> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM room_co_owners
                 WHERE room_id = ?1 AND user_id = ?2
                   AND EXISTS (SELECT 1 FROM rooms WHERE id = ?1 AND active = 1)",
                params![room_id, user_id],
            )?;
            if changed == 1 {
                return Ok(RoomWrite::Applied);
            }
            unchanged_or_refusal(conn, room_id)
        })
    }

    // -- Participants --

    /// Create the participant on first join, otherwise mark it active and refresh the ping.
    /// Refused for closed rooms.
    pub fn upsert_participant(
        &self,
        room_id: &str,
        user_id: &str,
        team_id: Option<&str>,
        now_ms: i64,
    ) -> Result<RoomWrite> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO participants (room_id, user_id, active, last_ping, team_id, joined_at)
                 SELECT ?1, ?2, 1, ?4, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM rooms WHERE id = ?1 AND active = 1)
                 ON CONFLICT(room_id, user_id) DO UPDATE SET
                     active = 1,
                     last_ping = MAX(excluded.last_ping, participants.last_ping + 1),
                     team_id = COALESCE(excluded.team_id, participants.team_id)",
                params![room_id, user_id, team_id, now_ms],
            )?;
            if changed == 1 {
                return Ok(RoomWrite::Applied);
            }
            room_write_refusal(conn, room_id)
        })
    }

    /// Heartbeat: `active = 1, last_ping = now`. Refused for closed rooms.
    ///
    /// `last_ping` strictly increases on every refresh so a grace-window
    /// compare-and-set can always tell that a ping happened.
    pub fn touch_participant(&self, room_id: &str, user_id: &str, now_ms: i64) -> Result<RoomWrite> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE participants SET active = 1, last_ping = MAX(?3, last_ping + 1)
                 WHERE room_id = ?1 AND user_id = ?2
                   AND EXISTS (SELECT 1 FROM rooms WHERE id = ?1 AND active = 1)",
                params![room_id, user_id, now_ms],
            )?;
            if changed == 1 {
                return Ok(RoomWrite::Applied);
            }
            room_write_refusal(conn, room_id)
        })
    }

    pub fn get_participant(&self, room_id: &str, user_id: &str) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT room_id, user_id, active, last_ping, team_id, joined_at
                 FROM participants WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id],
                |row| {
                    Ok(ParticipantRow {
                        room_id: row.get(0)?,
                        user_id: row.get(1)?,
                        active: row.get(2)?,
                        last_ping: row.get(3)?,
                        team_id: row.get(4)?,
                        joined_at: row.get(5)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn room_members(&self, room_id: &str) -> Result<Vec<MemberRow>> {
        self.with_conn(|conn| query_members(conn, room_id, None))
    }

    pub fn room_member(&self, room_id: &str, user_id: &str) -> Result<Option<MemberRow>> {
        self.with_conn(|conn| {
            let mut rows = query_members(conn, room_id, Some(user_id))?;
            Ok(rows.pop())
        })
    }

    /// Sweep: deactivate every active participant whose last ping is older than
    /// `cutoff_ms`. Returns the distinct rooms that had at least one row flipped.
    pub fn expire_stale_participants(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE participants SET active = 0
                 WHERE active = 1 AND last_ping < ?1
                   AND room_id IN (SELECT id FROM rooms WHERE active = 1)
                 RETURNING room_id",
            )?;
            let rooms = stmt
                .query_map([cutoff_ms], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<BTreeSet<_>, _>>()?;
            Ok(rooms.into_iter().collect())
        })
    }

    /// Grace-window compare-and-set: deactivate only if the participant is still
    /// active and has not pinged since `observed_ping_ms`.
    pub fn expire_if_unchanged(
        &self,
        room_id: &str,
        user_id: &str,
        observed_ping_ms: i64,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE participants SET active = 0
                 WHERE room_id = ?1 AND user_id = ?2 AND active = 1 AND last_ping = ?3",
                params![room_id, user_id, observed_ping_ms],
            )?;
            Ok(changed == 1)
        })
    }

    /// Explicit leave. Returns false if the participant was already inactive.
    pub fn deactivate_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE participants SET active = 0
                 WHERE room_id = ?1 AND user_id = ?2 AND active = 1",
                params![room_id, user_id],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Recovery credentials --

    /// Store `candidate` only if the participant has no credential yet, then
    /// return whichever credential is stored. `None` if there is no participant.
    pub fn issue_recovery_key(
        &self,
        room_id: &str,
        user_id: &str,
        candidate: &str,
    ) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE participants SET recovery_key = ?3
                 WHERE room_id = ?1 AND user_id = ?2 AND recovery_key IS NULL",
                params![room_id, user_id, candidate],
            )?;
            let key = conn
                .query_row(
                    "SELECT recovery_key FROM participants WHERE room_id = ?1 AND user_id = ?2",
                    params![room_id, user_id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?;
            Ok(key.flatten())
        })
    }

    /// Mark the credential as displayed. Only the first caller gets true.
    pub fn claim_recovery_display(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE participants SET recovery_shown = 1
                 WHERE room_id = ?1 AND user_id = ?2
                   AND recovery_shown = 0 AND recovery_key IS NOT NULL",
                params![room_id, user_id],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn find_by_recovery_key(&self, room_id: &str, key: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT u.id, u.username FROM participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.room_id = ?1 AND p.recovery_key = ?2",
                params![room_id, key],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Messages --

    /// Insert a message unless the room is closed or missing.
    pub fn insert_message(&self, msg: &MessageRow) -> Result<RoomWrite> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO messages (id, room_id, user_id, content, kind, llm_required, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                 WHERE EXISTS (SELECT 1 FROM rooms WHERE id = ?2 AND active = 1)",
                params![
                    msg.id,
                    msg.room_id,
                    msg.user_id,
                    msg.content,
                    msg.kind,
                    msg.llm_required,
                    msg.created_at
                ],
            )?;
            if changed == 1 {
                return Ok(RoomWrite::Applied);
            }
            room_write_refusal(conn, &msg.room_id)
        })
    }

    /// The most recent `limit` messages, oldest first.
    pub fn recent_messages(&self, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_recent_messages(conn, room_id, limit))
    }

    // -- Teams --

    pub fn list_teams(&self) -> Result<Vec<TeamRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, description FROM teams ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TeamRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false if a team with that name already exists.
    pub fn create_team(&self, id: &str, name: &str, description: &str, now_ms: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO teams (id, name, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, name, description, now_ms],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn delete_team(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM teams WHERE id = ?1", [id])?;
            Ok(changed == 1)
        })
    }

    pub fn team_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM teams WHERE id = ?1", [id], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Admin credential distribution --

    pub fn admin_credential(&self) -> Result<Option<AdminCredentialRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT key_hash, pending_key, acknowledged FROM admin_credentials WHERE id = 1",
                [],
                |row| {
                    Ok(AdminCredentialRow {
                        key_hash: row.get(0)?,
                        pending_key: row.get(1)?,
                        acknowledged: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Create the record if none exists. Returns false if one was already there.
    pub fn insert_admin_credential(&self, key_hash: &str, pending_key: &str, now_ms: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO admin_credentials (id, key_hash, pending_key, acknowledged, created_at)
                 VALUES (1, ?1, ?2, 0, ?3)",
                params![key_hash, pending_key, now_ms],
            )?;
            Ok(changed == 1)
        })
    }

    /// Take the pending plaintext exactly once: marks the record acknowledged
    /// and erases the plaintext in the same transaction.
    pub fn take_pending_admin_key(&self) -> Result<Option<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let pending: Option<String> = tx
                .query_row(
                    "SELECT pending_key FROM admin_credentials WHERE id = 1 AND acknowledged = 0",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if pending.is_some() {
                tx.execute(
                    "UPDATE admin_credentials SET acknowledged = 1, pending_key = NULL
                     WHERE id = 1 AND acknowledged = 0",
                    [],
                )?;
            }
            tx.commit()?;
            Ok(pending)
        })
    }

    // -- Health --

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }
}

fn query_room(conn: &Connection, id: &str) -> Result<Option<RoomRow>> {
    conn.query_row(
        "SELECT id, name, secret_key, owner_id, sketch_id, active, created_at
         FROM rooms WHERE id = ?1",
        [id],
        |row| {
            Ok(RoomRow {
                id: row.get(0)?,
                name: row.get(1)?,
                secret_key: row.get(2)?,
                owner_id: row.get(3)?,
                sketch_id: row.get(4)?,
                active: row.get(5)?,
                created_at: row.get(6)?,
            })
        },
    )
    .optional()
}

fn query_co_owners(conn: &Connection, room_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM room_co_owners WHERE room_id = ?1 ORDER BY granted_at, rowid",
    )?;
    let ids = stmt
        .query_map([room_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn query_members(conn: &Connection, room_id: &str, user_id: Option<&str>) -> Result<Vec<MemberRow>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, p.active, p.last_ping, p.team_id
         FROM participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.room_id = ?1 AND (?2 IS NULL OR p.user_id = ?2)
         ORDER BY LOWER(u.username), u.id",
    )?;
    let rows = stmt
        .query_map(params![room_id, user_id], |row| {
            Ok(MemberRow {
                user_id: row.get(0)?,
                username: row.get(1)?,
                active: row.get(2)?,
                last_ping: row.get(3)?,
                team_id: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_recent_messages(conn: &Connection, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
    // JOIN users to fetch the author name in a single query
    let mut stmt = conn.prepare(
        "SELECT id, room_id, user_id, username, content, kind, llm_required, created_at FROM (
             SELECT m.id, m.room_id, m.user_id, u.username, m.content, m.kind,
                    m.llm_required, m.created_at, m.rowid AS seq
             FROM messages m
             LEFT JOIN users u ON m.user_id = u.id
             WHERE m.room_id = ?1
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?2
         ) ORDER BY created_at, seq",
    )?;

    let rows = stmt
        .query_map(params![room_id, limit], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                user_id: row.get(2)?,
                username: row
                    .get::<_, Option<String>>(3)?
                    .unwrap_or_else(|| "unknown".to_string()),
                content: row.get(4)?,
                kind: row.get(5)?,
                llm_required: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn room_active(conn: &Connection, room_id: &str) -> Result<Option<bool>> {
    conn.query_row("SELECT active FROM rooms WHERE id = ?1", [room_id], |row| row.get(0))
        .optional()
}

/// Explain why a guarded write touched no row.
fn room_write_refusal(conn: &Connection, room_id: &str) -> Result<RoomWrite> {
    Ok(match room_active(conn, room_id)? {
        Some(false) => RoomWrite::RoomClosed,
        _ => RoomWrite::Missing,
    })
}

fn unchanged_or_refusal(conn: &Connection, room_id: &str) -> Result<RoomWrite> {
    Ok(match room_active(conn, room_id)? {
        Some(true) => RoomWrite::Unchanged,
        Some(false) => RoomWrite::RoomClosed,
        None => RoomWrite::Missing,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
