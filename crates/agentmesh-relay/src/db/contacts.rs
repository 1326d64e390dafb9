//! Contact-pair queries
//!
//! One row per unordered pair, keys stored with `agent_a < agent_b`.
//! Pending rows are deleted on deny or remove so the same requester can ask
//! again; only the non-requester may accept or deny.

use rusqlite::{params, Connection, OptionalExtension};

use agentmesh_core::relay::{ContactInfo, PendingContactInfo};

use crate::error::{RelayError, Result};

use super::{epoch_to_iso, now_epoch};

/// Order two usernames into the canonical `(agent_a, agent_b)` pair.
pub fn ordered<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x < y {
        (x, y)
    } else {
        (y, x)
    }
}

#[derive(Debug, Clone)]
pub struct ContactRow {
    pub agent_a: String,
    pub agent_b: String,
    pub status: String,
    pub requested_by: String,
    pub greeting: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_of(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok(ContactRow {
        agent_a: row.get(0)?,
        agent_b: row.get(1)?,
        status: row.get(2)?,
        requested_by: row.get(3)?,
        greeting: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const COLUMNS: &str = "agent_a, agent_b, status, requested_by, greeting, created_at, updated_at";

/// Fetch the row for an unordered pair, if any.
pub fn get(conn: &Connection, x: &str, y: &str) -> Result<Option<ContactRow>> {
    let (a, b) = ordered(x, y);
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM contacts WHERE agent_a = ?1 AND agent_b = ?2"),
        params![a, b],
        row_of,
    )
    .optional()
    .map_err(RelayError::Sqlite)
}

/// Insert a pending request from `from` to `to`.
///
/// # Errors
///
/// `Conflict` when a pending or active row already exists.
pub fn request(conn: &Connection, from: &str, to: &str, greeting: Option<&str>) -> Result<()> {
    if let Some(existing) = get(conn, from, to)? {
        return Err(RelayError::Conflict(format!(
            "contact already {}",
            existing.status
        )));
    }
    let (a, b) = ordered(from, to);
    let now = now_epoch();
    let tx_guard = conn.unchecked_transaction()?;
    conn.execute(
        &format!(
            "INSERT INTO contacts ({COLUMNS}) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)"
        ),
        params![a, b, from, greeting, now],
    )?;
    tx_guard.commit()?;
    Ok(())
}

/// Pending requests where `agent` is a party but not the requester.
pub fn pending_for(conn: &Connection, agent: &str) -> Result<Vec<PendingContactInfo>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM contacts
         WHERE status = 'pending' AND (agent_a = ?1 OR agent_b = ?1) AND requested_by != ?1
         ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([agent], row_of)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .map(|row| PendingContactInfo {
            from: row.requested_by.clone(),
            greeting: row.greeting,
            requested_at: epoch_to_iso(row.created_at),
        })
        .collect())
}

fn pending_row_for_action(conn: &Connection, caller: &str, other: &str) -> Result<ContactRow> {
    let row = get(conn, caller, other)?
        .ok_or_else(|| RelayError::NotFound("no contact request between these agents".into()))?;
    if row.status != "pending" {
        return Err(RelayError::Conflict("contact is not pending".into()));
    }
    if row.requested_by == caller {
        return Err(RelayError::Validation(
            "only the recipient may act on a pending request".into(),
        ));
    }
    Ok(row)
}

/// Accept a pending request: `pending → active`. Only the non-requester.
pub fn accept(conn: &Connection, caller: &str, other: &str) -> Result<()> {
    let tx_guard = conn.unchecked_transaction()?;
    pending_row_for_action(conn, caller, other)?;
    let (a, b) = ordered(caller, other);
    conn.execute(
        "UPDATE contacts SET status = 'active', updated_at = ?3
         WHERE agent_a = ?1 AND agent_b = ?2",
        params![a, b, now_epoch()],
    )?;
    tx_guard.commit()?;
    Ok(())
}

/// Deny a pending request: the row is deleted so the requester may retry.
pub fn deny(conn: &Connection, caller: &str, other: &str) -> Result<()> {
    let tx_guard = conn.unchecked_transaction()?;
    pending_row_for_action(conn, caller, other)?;
    let (a, b) = ordered(caller, other);
    conn.execute(
        "DELETE FROM contacts WHERE agent_a = ?1 AND agent_b = ?2",
        params![a, b],
    )?;
    tx_guard.commit()?;
    Ok(())
}

/// Remove an active pair. Either party may remove; the row is deleted.
pub fn remove(conn: &Connection, caller: &str, other: &str) -> Result<()> {
    let row = get(conn, caller, other)?
        .ok_or_else(|| RelayError::NotFound("no contact between these agents".into()))?;
    if row.status != "active" {
        return Err(RelayError::Conflict("contact is not active".into()));
    }
    let (a, b) = ordered(caller, other);
    let tx_guard = conn.unchecked_transaction()?;
    conn.execute(
        "DELETE FROM contacts WHERE agent_a = ?1 AND agent_b = ?2",
        params![a, b],
    )?;
    tx_guard.commit()?;
    Ok(())
}

/// Active contacts of `agent`, joined against the agents table.
pub fn list_for(conn: &Connection, agent: &str, staleness_secs: i64) -> Result<Vec<ContactInfo>> {
    let mut stmt = conn.prepare(
        "SELECT CASE WHEN c.agent_a = ?1 THEN c.agent_b ELSE c.agent_a END AS peer,
                a.public_key, a.endpoint, c.updated_at, a.last_seen, a.key_updated_at
         FROM contacts c
         JOIN agents a ON a.name = CASE WHEN c.agent_a = ?1 THEN c.agent_b ELSE c.agent_a END
         WHERE c.status = 'active' AND (c.agent_a = ?1 OR c.agent_b = ?1)
         ORDER BY peer",
    )?;

    let now = now_epoch();
    let rows = stmt
        .query_map([agent], |row| {
            let last_seen: Option<i64> = row.get(4)?;
            Ok(ContactInfo {
                agent: row.get(0)?,
                public_key: row.get(1)?,
                endpoint: row.get(2)?,
                since: epoch_to_iso(row.get(3)?),
                online: last_seen.map(|seen| now - seen <= staleness_secs).unwrap_or(false),
                last_seen: last_seen.map(epoch_to_iso),
                key_updated_at: row.get::<_, Option<i64>>(5)?.map(epoch_to_iso),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
