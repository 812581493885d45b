//! Database schema migrations for SQLite.
//!
//! Versioned migrations: each `apply_vN` moves the schema from N-1 to N.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "migrated store schema");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: receipts, contacts, conversations, messages.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One resolved receipt per thread, CBOR-encoded record
        CREATE TABLE join_receipts (
            thread_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,             -- ready | blocked | burned
            record BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE contacts (
            pubkey TEXT PRIMARY KEY,
            verified INTEGER NOT NULL DEFAULT 0,
            verified_safety_number TEXT,
            last_verified_safety_number TEXT
        );

        CREATE TABLE conversations (
            thread_id TEXT PRIMARY KEY,
            peer_public_key TEXT NOT NULL,
            self_public_key TEXT NOT NULL
        );

        CREATE TABLE messages (
            rowid_seq INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id TEXT NOT NULL,
            message_id TEXT,
            author TEXT NOT NULL,
            text TEXT NOT NULL,
            sent_at INTEGER NOT NULL,
            system INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_messages_thread ON messages(thread_id, rowid_seq);
        CREATE INDEX idx_conversations_peer ON conversations(peer_public_key COLLATE NOCASE);
        "#,
    )?;

    Ok(())
}

/// Migration v2: explicit per-thread safety warning flag.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE conversations ADD COLUMN safety_warning_sent INTEGER NOT NULL DEFAULT 0;",
    )?;
    Ok(())
}

pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
