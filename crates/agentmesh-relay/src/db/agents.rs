//! Agent registry queries

use rusqlite::{params, Connection, OptionalExtension};

use agentmesh_core::relay::{AgentInfo, AgentStatus};

use crate::error::{RelayError, Result};

use super::{epoch_to_iso, now_epoch};

/// A raw agent row.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub name: String,
    pub public_key: String,
    pub owner_email: String,
    pub endpoint: Option<String>,
    pub email_verified: bool,
    pub status: AgentStatus,
    pub last_seen: Option<i64>,
    pub created_at: i64,
    pub approved_by: Option<String>,
    pub approved_at: Option<i64>,
    pub key_updated_at: Option<i64>,
    pub pending_key: Option<String>,
    pub pending_key_effective_at: Option<i64>,
}

impl AgentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        Ok(Self {
            name: row.get("name")?,
            public_key: row.get("public_key")?,
            owner_email: row.get("owner_email")?,
            endpoint: row.get("endpoint")?,
            email_verified: row.get("email_verified")?,
            status: match status.as_str() {
                "active" => AgentStatus::Active,
                "revoked" => AgentStatus::Revoked,
                _ => AgentStatus::Pending,
            },
            last_seen: row.get("last_seen")?,
            created_at: row.get("created_at")?,
            approved_by: row.get("approved_by")?,
            approved_at: row.get("approved_at")?,
            key_updated_at: row.get("key_updated_at")?,
            pending_key: row.get("pending_key")?,
            pending_key_effective_at: row.get("pending_key_effective_at")?,
        })
    }

    /// Whether the agent counts as online given the staleness window.
    pub fn online(&self, staleness_secs: i64) -> bool {
        self.last_seen
            .map(|seen| now_epoch() - seen <= staleness_secs)
            .unwrap_or(false)
    }

    /// Public wire view.
    pub fn to_info(&self) -> AgentInfo {
        AgentInfo {
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            endpoint: self.endpoint.clone(),
            status: self.status,
            last_seen: self.last_seen.map(epoch_to_iso),
            created_at: epoch_to_iso(self.created_at),
            key_updated_at: self.key_updated_at.map(epoch_to_iso),
        }
    }
}

const SELECT_COLUMNS: &str = "name, public_key, owner_email, endpoint, email_verified, status, \
     last_seen, created_at, approved_by, approved_at, key_updated_at, pending_key, \
     pending_key_effective_at";

/// Insert a new agent in `pending` status.
pub fn insert(
    conn: &Connection,
    name: &str,
    public_key: &str,
    owner_email: &str,
    endpoint: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO agents (name, public_key, owner_email, endpoint, email_verified, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, 'pending', ?5)",
        params![name, public_key, owner_email, endpoint, now_epoch()],
    )?;
    Ok(())
}

/// Fetch an agent or `None`.
pub fn get(conn: &Connection, name: &str) -> Result<Option<AgentRow>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM agents WHERE name = ?1"),
        [name],
        AgentRow::from_row,
    )
    .optional()
    .map_err(RelayError::Sqlite)
}

/// Fetch an agent or 404.
pub fn require(conn: &Connection, name: &str) -> Result<AgentRow> {
    get(conn, name)?.ok_or_else(|| RelayError::NotFound(format!("unknown agent: {name}")))
}

/// All agents, name order.
pub fn list(conn: &Connection) -> Result<Vec<AgentRow>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM agents ORDER BY name"))?;
    let rows = stmt
        .query_map([], AgentRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Agents awaiting admin approval.
pub fn list_pending(conn: &Connection) -> Result<Vec<AgentRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM agents WHERE status = 'pending' ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([], AgentRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Count of all agents (health endpoint).
pub fn count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// `pending → active` on admin approval.
pub fn approve(conn: &Connection, name: &str, approved_by: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE agents SET status = 'active', approved_by = ?2, approved_at = ?3
         WHERE name = ?1 AND status = 'pending'",
        params![name, approved_by, now_epoch()],
    )?;
    if changed == 0 {
        let row = require(conn, name)?;
        return Err(match row.status {
            AgentStatus::Active => RelayError::Conflict(format!("{name} is already active")),
            AgentStatus::Revoked => RelayError::Forbidden(format!("{name} is revoked")),
            AgentStatus::Pending => RelayError::Internal("approve raced".into()),
        });
    }
    Ok(())
}

/// Mark an agent revoked. Idempotent; revocation is terminal.
pub fn revoke(conn: &Connection, name: &str) -> Result<()> {
    require(conn, name)?;
    conn.execute(
        "UPDATE agents SET status = 'revoked' WHERE name = ?1",
        [name],
    )?;
    Ok(())
}

/// Heartbeat: update `last_seen` and the advertised endpoint.
pub fn heartbeat(conn: &Connection, name: &str, endpoint: &str) -> Result<()> {
    conn.execute(
        "UPDATE agents SET last_seen = ?2, endpoint = ?3 WHERE name = ?1",
        params![name, now_epoch(), endpoint],
    )?;
    Ok(())
}

/// Replace the agent's public key (rotation signed with the old key).
pub fn rotate_key(conn: &Connection, name: &str, new_key: &str) -> Result<()> {
    conn.execute(
        "UPDATE agents SET public_key = ?2, key_updated_at = ?3 WHERE name = ?1",
        params![name, new_key, now_epoch()],
    )?;
    Ok(())
}

/// Stage a recovery key that becomes effective after the cooling-off window.
pub fn stage_recovery_key(
    conn: &Connection,
    name: &str,
    new_key: &str,
    effective_at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE agents SET pending_key = ?2, pending_key_effective_at = ?3 WHERE name = ?1",
        params![name, new_key, effective_at],
    )?;
    Ok(())
}

/// Apply any staged recovery key whose cooling-off window has passed.
/// Returns `true` if a key was applied.
pub fn apply_due_recovery_key(conn: &Connection, name: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE agents
         SET public_key = pending_key, key_updated_at = ?2,
             pending_key = NULL, pending_key_effective_at = NULL
         WHERE name = ?1 AND pending_key IS NOT NULL AND pending_key_effective_at <= ?2",
        params![name, now_epoch()],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory;

    fn seeded() -> Connection {
        let conn = open_memory().unwrap();
        insert(&conn, "alice", "key-a", "alice@example.org", "https://a.example.org").unwrap();
        conn
    }

    #[test]
    fn test_insert_and_get() {
        let conn = seeded();
        let row = require(&conn, "alice").unwrap();
        assert_eq!(row.status, AgentStatus::Pending);
        assert!(row.email_verified);
        assert!(row.last_seen.is_none());
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let conn = seeded();
        assert!(insert(&conn, "alice", "k", "e", "https://x").is_err());
    }

    #[test]
    fn test_approve_lifecycle() {
        let conn = seeded();
        approve(&conn, "alice", "admin").unwrap();
        let row = require(&conn, "alice").unwrap();
        assert_eq!(row.status, AgentStatus::Active);
        assert_eq!(row.approved_by.as_deref(), Some("admin"));

        // Second approval conflicts
        assert!(matches!(
            approve(&conn, "alice", "admin"),
            Err(RelayError::Conflict(_))
        ));
    }

    #[test]
    fn test_revoke_terminal_and_idempotent() {
        let conn = seeded();
        approve(&conn, "alice", "admin").unwrap();
        revoke(&conn, "alice").unwrap();
        revoke(&conn, "alice").unwrap();
        assert_eq!(require(&conn, "alice").unwrap().status, AgentStatus::Revoked);

        // A revoked name cannot be approved again
        assert!(approve(&conn, "alice", "admin").is_err());
    }

    #[test]
    fn test_heartbeat_updates_presence() {
        let conn = seeded();
        approve(&conn, "alice", "admin").unwrap();
        heartbeat(&conn, "alice", "https://new.example.org").unwrap();
        let row = require(&conn, "alice").unwrap();
        assert!(row.online(600));
        assert_eq!(row.endpoint.as_deref(), Some("https://new.example.org"));
    }

    #[test]
    fn test_recovery_key_cooldown() {
        let conn = seeded();
        approve(&conn, "alice", "admin").unwrap();

        // Staged for one hour from now: not applied yet
        stage_recovery_key(&conn, "alice", "key-new", now_epoch() + 3600).unwrap();
        assert!(!apply_due_recovery_key(&conn, "alice").unwrap());
        assert_eq!(require(&conn, "alice").unwrap().public_key, "key-a");

        // Staged in the past: applied
        stage_recovery_key(&conn, "alice", "key-new", now_epoch() - 1).unwrap();
        assert!(apply_due_recovery_key(&conn, "alice").unwrap());
        let row = require(&conn, "alice").unwrap();
        assert_eq!(row.public_key, "key-new");
        assert!(row.pending_key.is_none());
    }
}
