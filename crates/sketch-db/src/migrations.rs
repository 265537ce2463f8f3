use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS teams (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            secret_key  TEXT NOT NULL,
            owner_id    TEXT NOT NULL REFERENCES users(id),
            sketch_id   TEXT,
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  INTEGER NOT NULL
        );

        -- Append-only co-owner set: the primary key makes grants a set union
        CREATE TABLE IF NOT EXISTS room_co_owners (
            room_id     TEXT NOT NULL REFERENCES rooms(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            granted_at  INTEGER NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS participants (
            room_id         TEXT NOT NULL REFERENCES rooms(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            active          INTEGER NOT NULL DEFAULT 1,
            last_ping       INTEGER NOT NULL,
            recovery_key    TEXT,
            recovery_shown  INTEGER NOT NULL DEFAULT 0,
            team_id         TEXT REFERENCES teams(id) ON DELETE SET NULL,
            joined_at       INTEGER NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_participants_recovery
            ON participants(room_id, recovery_key)
            WHERE recovery_key IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_participants_stale
            ON participants(active, last_ping);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            room_id         TEXT NOT NULL REFERENCES rooms(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            kind            TEXT NOT NULL DEFAULT 'plain',
            llm_required    INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at);

        -- Single-row admin credential distribution record
        CREATE TABLE IF NOT EXISTS admin_credentials (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            key_hash        TEXT NOT NULL,
            pending_key     TEXT,
            acknowledged    INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
