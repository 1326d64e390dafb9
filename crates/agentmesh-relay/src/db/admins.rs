//! Admin key table
//!
//! Admin keys are independent keypairs, never the agent's identity key.
//! Admin operations verify signatures against this table.

use rusqlite::{params, Connection, OptionalExtension};

use agentmesh_core::relay::AdminKeyInfo;

use crate::error::{RelayError, Result};

use super::now_epoch;

/// Register an admin key for `agent`.
pub fn add(conn: &Connection, agent: &str, admin_public_key: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO admins (agent, admin_public_key, added_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(agent) DO UPDATE SET admin_public_key = ?2, added_at = ?3",
        params![agent, admin_public_key, now_epoch()],
    )?;
    Ok(())
}

/// The admin key for `agent`, if they are an admin.
pub fn key_for(conn: &Connection, agent: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT admin_public_key FROM admins WHERE agent = ?1",
        [agent],
        |row| row.get(0),
    )
    .optional()
    .map_err(RelayError::Sqlite)
}

/// All admin keys, for the client-side broadcast verification cache.
pub fn list(conn: &Connection) -> Result<Vec<AdminKeyInfo>> {
    let mut stmt =
        conn.prepare("SELECT agent, admin_public_key FROM admins ORDER BY agent")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AdminKeyInfo {
                agent: row.get(0)?,
                public_key: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
