//! Database access layer
//!
//! One SQLite database holds all durable relay state. WAL mode, foreign
//! keys enforced, all timestamps Unix epoch seconds, schema version in
//! `PRAGMA user_version`. Query functions live in per-table modules and
//! take a plain `&Connection`; transactions wrap the contact-pair and group
//! mutations that must be atomic.

pub mod admins;
pub mod agents;
pub mod broadcasts;
pub mod contacts;
pub mod groups;
pub mod schema;
pub mod verifications;

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::{RelayError, Result};

/// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Open or create the relay database at the given path.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Run pending migrations. Forward-only.
fn migrate(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current == 0 {
        tracing::info!("Initializing relay schema v{SCHEMA_VERSION}");
        conn.execute_batch(schema::SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if current > SCHEMA_VERSION {
        return Err(RelayError::Internal(format!(
            "database version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    // Incremental migrations slot in here as versions grow.

    Ok(())
}

/// Current time as Unix epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Render an epoch-seconds timestamp as ISO-8601 UTC for the wire.
pub fn epoch_to_iso(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse an ISO-8601 timestamp into epoch seconds.
pub fn iso_to_epoch(iso: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| dt.timestamp())
}
