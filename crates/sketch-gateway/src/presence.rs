use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sketch_db::models::{MemberRow, parse_id};
use sketch_db::queries::RoomWrite;
use sketch_db::{Database, from_millis, to_millis};
use sketch_types::events::ServerEvent;
use sketch_types::models::{Member, PresenceStatus};
use sketch_types::{SketchError, SketchResult};

use crate::dispatcher::Dispatcher;
use crate::store::{Store, blocking};

/// Presence timings.
///
/// `away_after` only affects the displayed status. The persisted `active`
/// flag is cleared by the sweep (`inactive_after`) or by the grace callback
/// (`grace_window`), whichever observes staleness first.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub away_after: Duration,
    pub inactive_after: Duration,
    pub sweep_interval: Duration,
    pub grace_window: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            away_after: Duration::from_secs(5 * 60),
            inactive_after: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(30),
            grace_window: Duration::from_secs(15 * 60),
        }
    }
}

/// Display status: inactive if not persisted-active, away once the last ping
/// is older than `away_after`, otherwise active.
pub fn derive_status(active: bool, seconds_since_ping: i64, away_after: Duration) -> PresenceStatus {
    if !active {
        PresenceStatus::Inactive
    } else if seconds_since_ping > away_after.as_secs() as i64 {
        PresenceStatus::Away
    } else {
        PresenceStatus::Active
    }
}

/// Tracks participant liveness and keeps the persisted `active` flag honest.
#[derive(Clone)]
pub struct PresenceTracker {
    db: Store,
    dispatcher: Dispatcher,
    config: Arc<PresenceConfig>,
}

impl PresenceTracker {
    pub fn new(db: Store, dispatcher: Dispatcher, config: PresenceConfig) -> Self {
        Self {
            db,
            dispatcher,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Mark the participant active with a fresh ping and tell the room.
    pub async fn record_heartbeat(&self, room_id: Uuid, user_id: Uuid) -> SketchResult<()> {
        self.record_heartbeat_at(room_id, user_id, Utc::now()).await
    }

    pub async fn record_heartbeat_at(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> SketchResult<()> {
        let away_after = self.config.away_after;
        let (room, user) = (room_id.to_string(), user_id.to_string());
        let (write, member) = blocking(&self.db, move |db| {
            let write = db.touch_participant(&room, &user, to_millis(now))?;
            if write != RoomWrite::Applied {
                return Ok((write, None));
            }
            let member = load_member(db, &room, &user, now, away_after)?;
            Ok((write, member))
        })
        .await?;

        match write {
            RoomWrite::Applied => {
                if let Some(user) = member {
                    self.dispatcher
                        .emit_to_room(room_id, ServerEvent::UserStatusUpdate { room_id, user });
                }
                Ok(())
            }
            RoomWrite::RoomClosed => Err(SketchError::conflict("room is closed")),
            RoomWrite::Missing | RoomWrite::Unchanged => Err(SketchError::not_found("participant not found")),
        }
    }

    /// Full member list of a room with derived statuses.
    pub async fn members(&self, room_id: Uuid) -> SketchResult<Vec<Member>> {
        self.members_at(room_id, Utc::now()).await
    }

    pub async fn members_at(&self, room_id: Uuid, now: DateTime<Utc>) -> SketchResult<Vec<Member>> {
        let away_after = self.config.away_after;
        let room = room_id.to_string();
        blocking(&self.db, move |db| load_members(db, &room, now, away_after))
            .await?
            .ok_or_else(|| SketchError::not_found("room not found"))
    }

    /// Emit `update_active_users` with the current member list.
    pub async fn broadcast_members(&self, room_id: Uuid) -> SketchResult<usize> {
        self.broadcast_members_at(room_id, Utc::now()).await
    }

    async fn broadcast_members_at(&self, room_id: Uuid, now: DateTime<Utc>) -> SketchResult<usize> {
        let active_users = self.members_at(room_id, now).await?;
        Ok(self.dispatcher.emit_to_room(
            room_id,
            ServerEvent::UpdateActiveUsers {
                room_id,
                active_users,
            },
        ))
    }

    pub async fn sweep(&self) -> SketchResult<Vec<Uuid>> {
        self.sweep_at(Utc::now()).await
    }

    /// Deactivate every participant whose last ping is older than the
    /// inactivity threshold, then broadcast one member list per affected room.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SketchResult<Vec<Uuid>> {
        let cutoff = to_millis(now) - self.config.inactive_after.as_millis() as i64;
        let rooms = blocking(&self.db, move |db| db.expire_stale_participants(cutoff)).await?;

        let mut affected = Vec::with_capacity(rooms.len());
        for raw in rooms {
            let room_id = match parse_id(&raw) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Sweep skipped room: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.broadcast_members_at(room_id, now).await {
                warn!("Sweep broadcast for room {} failed: {}", room_id, e);
            }
            affected.push(room_id);
        }

        if !affected.is_empty() {
            info!("Presence sweep marked stale participants inactive in {} rooms", affected.len());
        }
        Ok(affected)
    }

    /// Start the grace window for a lost connection. Nothing is scheduled if
    /// the participant is unknown or already inactive.
    pub async fn on_disconnect(&self, room_id: Uuid, user_id: Uuid) -> SketchResult<Option<JoinHandle<()>>> {
        let observed = self.observe_ping(room_id, user_id).await?;
        Ok(observed.map(|ping| self.schedule_grace(room_id, user_id, ping)))
    }

    /// Last ping of an active participant.
    pub async fn observe_ping(&self, room_id: Uuid, user_id: Uuid) -> SketchResult<Option<i64>> {
        let (room, user) = (room_id.to_string(), user_id.to_string());
        let participant = blocking(&self.db, move |db| db.get_participant(&room, &user)).await?;
        Ok(participant.filter(|p| p.active).map(|p| p.last_ping))
    }

    /// One-shot timer; never cancelled. On firing it re-checks the store.
    pub fn schedule_grace(&self, room_id: Uuid, user_id: Uuid, observed_ping_ms: i64) -> JoinHandle<()> {
        let tracker = self.clone();
        let grace = self.config.grace_window;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match tracker.expire_after_grace(room_id, user_id, observed_ping_ms).await {
                Ok(true) => debug!("{} marked inactive in room {} after grace window", user_id, room_id),
                Ok(false) => debug!("{} in room {} came back before grace window ended", user_id, room_id),
                Err(e) => warn!("Grace check for {} in room {} failed: {}", user_id, room_id, e),
            }
        })
    }

    /// Compare-and-set: deactivate only if nothing refreshed the ping since
    /// `observed_ping_ms`. Broadcasts only when the row actually changed.
    pub async fn expire_after_grace(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        observed_ping_ms: i64,
    ) -> SketchResult<bool> {
        let (room, user) = (room_id.to_string(), user_id.to_string());
        let changed = blocking(&self.db, move |db| {
            db.expire_if_unchanged(&room, &user, observed_ping_ms)
        })
        .await?;
        if changed {
            self.broadcast_members(room_id).await?;
        }
        Ok(changed)
    }

    /// Explicit leave: deactivate now instead of waiting for the grace window.
    pub async fn leave(&self, room_id: Uuid, user_id: Uuid) -> SketchResult<bool> {
        let (room, user) = (room_id.to_string(), user_id.to_string());
        let left = blocking(&self.db, move |db| {
            if !db.deactivate_participant(&room, &user)? {
                return Ok(None);
            }
            Ok(Some(db.get_user(&user)?.map(|row| row.username).unwrap_or_default()))
        })
        .await?;
        let Some(username) = left else {
            return Ok(false);
        };

        debug!("{} left room {}", user_id, room_id);
        self.dispatcher.emit_to_room(
            room_id,
            ServerEvent::UserLeft {
                room_id,
                user_id,
                username,
            },
        );
        self.broadcast_members(room_id).await?;
        Ok(true)
    }

    /// Periodic liveness backstop. A failed iteration is logged and retried next tick.
    pub async fn run_sweep_loop(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Presence sweep running every {:?}", self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Presence sweep stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("Presence sweep failed, retrying next cycle: {}", e);
                    }
                }
            }
        }
    }
}

/// Member list of a room, or `None` if the room does not exist.
pub(crate) fn load_members(
    db: &Database,
    room_id: &str,
    now: DateTime<Utc>,
    away_after: Duration,
) -> anyhow::Result<Option<Vec<Member>>> {
    let Some(room) = db.get_room(room_id)? else {
        return Ok(None);
    };
    let co_owners = db.co_owners(room_id)?;
    db.room_members(room_id)?
        .into_iter()
        .map(|row| member_from_row(row, &room.owner_id, &co_owners, now, away_after))
        .collect::<anyhow::Result<Vec<_>>>()
        .map(Some)
}

fn load_member(
    db: &Database,
    room_id: &str,
    user_id: &str,
    now: DateTime<Utc>,
    away_after: Duration,
) -> anyhow::Result<Option<Member>> {
    let Some(room) = db.get_room(room_id)? else {
        return Ok(None);
    };
    let co_owners = db.co_owners(room_id)?;
    db.room_member(room_id, user_id)?
        .map(|row| member_from_row(row, &room.owner_id, &co_owners, now, away_after))
        .transpose()
}

fn member_from_row(
    row: MemberRow,
    owner_id: &str,
    co_owners: &[String],
    now: DateTime<Utc>,
    away_after: Duration,
) -> anyhow::Result<Member> {
    let seconds_since_ping = (to_millis(now) - row.last_ping) / 1000;
    Ok(Member {
        id: parse_id(&row.user_id)?,
        status: derive_status(row.active, seconds_since_ping, away_after),
        last_ping: from_millis(row.last_ping),
        team_id: row.team_id.as_deref().map(parse_id).transpose()?,
        is_owner: row.user_id == owner_id,
        is_co_owner: co_owners.contains(&row.user_id),
        username: row.username,
    })
}
