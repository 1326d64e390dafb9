//! Broadcast storage
//!
//! Rows are append-only; receivers deduplicate by id.

use rusqlite::{params, Connection};

use agentmesh_core::relay::{BroadcastKind, BroadcastRecord};

use crate::error::Result;

use super::{epoch_to_iso, now_epoch};

/// Append one broadcast.
pub fn insert(
    conn: &Connection,
    id: &str,
    kind: BroadcastKind,
    payload: &str,
    sender: &str,
    signature: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO broadcasts (id, type, payload, sender, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, kind.as_str(), payload, sender, signature, now_epoch()],
    )?;
    Ok(())
}

/// All broadcasts, newest last.
pub fn list(conn: &Connection) -> Result<Vec<BroadcastRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, type, payload, sender, signature, created_at
         FROM broadcasts ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let kind: String = row.get(1)?;
            Ok(BroadcastRecord {
                id: row.get(0)?,
                broadcast_type: BroadcastKind::parse(&kind)
                    .unwrap_or(BroadcastKind::Announcement),
                payload: row.get(2)?,
                sender: row.get(3)?,
                signature: row.get(4)?,
                created_at: epoch_to_iso(row.get(5)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Broadcasts of one type (revocation audits, tests).
pub fn list_by_kind(conn: &Connection, kind: BroadcastKind) -> Result<Vec<BroadcastRecord>> {
    Ok(list(conn)?
        .into_iter()
        .filter(|b| b.broadcast_type == kind)
        .collect())
}
