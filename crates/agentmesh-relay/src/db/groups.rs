//! Group, membership, and invitation queries
//!
//! A group has exactly one `owner` member; invitations are deleted on
//! accept or decline. Membership mutations append to `group_changes` so
//! clients can refresh member caches incrementally.

use rusqlite::{params, Connection, OptionalExtension};

use agentmesh_core::relay::{
    GroupChange, GroupInfo, GroupInvitationInfo, GroupMemberInfo, GroupRole, GroupSettings,
};

use crate::error::{RelayError, Result};

use super::{epoch_to_iso, now_epoch};

/// Hard ceiling on group size
pub const MAX_MEMBERS: u32 = 50;

fn role_from(s: &str) -> GroupRole {
    match s {
        "owner" => GroupRole::Owner,
        "admin" => GroupRole::Admin,
        _ => GroupRole::Member,
    }
}

fn record_change(conn: &Connection, group_id: &str, change: &str, agent: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO group_changes (group_id, change, agent, at) VALUES (?1, ?2, ?3, ?4)",
        params![group_id, change, agent, now_epoch()],
    )?;
    Ok(())
}

/// Create a group with `owner` as its first member.
pub fn create(
    conn: &Connection,
    group_id: &str,
    name: &str,
    owner: &str,
    settings: &GroupSettings,
) -> Result<()> {
    if settings.max_members > MAX_MEMBERS {
        return Err(RelayError::Validation(format!(
            "maxMembers may not exceed {MAX_MEMBERS}"
        )));
    }
    let now = now_epoch();
    let tx_guard = conn.unchecked_transaction()?;
    conn.execute(
        "INSERT INTO groups (group_id, name, owner, status, members_can_invite, members_can_send, max_members, created_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7)",
        params![
            group_id,
            name,
            owner,
            settings.members_can_invite,
            settings.members_can_send,
            settings.max_members,
            now
        ],
    )?;
    conn.execute(
        "INSERT INTO group_members (group_id, agent, role, joined_at) VALUES (?1, ?2, 'owner', ?3)",
        params![group_id, owner, now],
    )?;
    record_change(conn, group_id, "member-added", Some(owner))?;
    tx_guard.commit()?;
    Ok(())
}

/// Fetch a group or 404. Dissolved groups still resolve (status tells).
pub fn require(conn: &Connection, group_id: &str) -> Result<GroupInfo> {
    conn.query_row(
        "SELECT group_id, name, owner, status, members_can_invite, members_can_send, max_members, created_at
         FROM groups WHERE group_id = ?1",
        [group_id],
        |row| {
            Ok(GroupInfo {
                group_id: row.get(0)?,
                name: row.get(1)?,
                owner: row.get(2)?,
                status: row.get(3)?,
                settings: GroupSettings {
                    members_can_invite: row.get(4)?,
                    members_can_send: row.get(5)?,
                    max_members: row.get(6)?,
                },
                created_at: epoch_to_iso(row.get(7)?),
            })
        },
    )
    .optional()?
    .ok_or_else(|| RelayError::NotFound(format!("unknown group: {group_id}")))
}

/// Groups the agent belongs to.
pub fn list_for(conn: &Connection, agent: &str) -> Result<Vec<GroupInfo>> {
    let mut stmt = conn.prepare(
        "SELECT g.group_id FROM groups g
         JOIN group_members m ON m.group_id = g.group_id
         WHERE m.agent = ?1 AND g.status = 'active'
         ORDER BY g.created_at",
    )?;
    let ids = stmt
        .query_map([agent], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    ids.iter().map(|id| require(conn, id)).collect()
}

/// The caller's role in a group, if a member.
pub fn role_of(conn: &Connection, group_id: &str, agent: &str) -> Result<Option<GroupRole>> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM group_members WHERE group_id = ?1 AND agent = ?2",
            params![group_id, agent],
            |row| row.get(0),
        )
        .optional()?;
    Ok(role.as_deref().map(role_from))
}

/// Member list joined with presence material from the agents table.
pub fn members(conn: &Connection, group_id: &str, staleness_secs: i64) -> Result<Vec<GroupMemberInfo>> {
    let mut stmt = conn.prepare(
        "SELECT m.agent, m.role, m.joined_at, a.public_key, a.endpoint, a.last_seen
         FROM group_members m
         JOIN agents a ON a.name = m.agent
         WHERE m.group_id = ?1
         ORDER BY m.joined_at, m.agent",
    )?;
    let now = now_epoch();
    let rows = stmt
        .query_map([group_id], |row| {
            let role: String = row.get(1)?;
            let last_seen: Option<i64> = row.get(5)?;
            Ok(GroupMemberInfo {
                agent: row.get(0)?,
                role: role_from(&role),
                joined_at: epoch_to_iso(row.get(2)?),
                public_key: row.get(3)?,
                endpoint: row.get(4)?,
                online: last_seen.map(|seen| now - seen <= staleness_secs).unwrap_or(false),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn member_count(conn: &Connection, group_id: &str) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM group_members WHERE group_id = ?1",
        [group_id],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// Record an invitation.
pub fn invite(
    conn: &Connection,
    group_id: &str,
    invitee: &str,
    invited_by: &str,
    greeting: Option<&str>,
) -> Result<()> {
    if role_of(conn, group_id, invitee)?.is_some() {
        return Err(RelayError::Conflict(format!("{invitee} is already a member")));
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO group_invitations (group_id, invitee, invited_by, greeting, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![group_id, invitee, invited_by, greeting, now_epoch()],
    )?;
    if inserted == 0 {
        return Err(RelayError::Conflict(format!(
            "{invitee} is already invited"
        )));
    }
    Ok(())
}

/// Invitations addressed to one agent.
pub fn invitations_for(conn: &Connection, agent: &str) -> Result<Vec<GroupInvitationInfo>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, invitee, invited_by, greeting, created_at
         FROM group_invitations WHERE invitee = ?1 ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map([agent], |row| {
            Ok(GroupInvitationInfo {
                group_id: row.get(0)?,
                invitee: row.get(1)?,
                invited_by: row.get(2)?,
                greeting: row.get(3)?,
                created_at: epoch_to_iso(row.get(4)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn take_invitation(conn: &Connection, group_id: &str, invitee: &str) -> Result<()> {
    let deleted = conn.execute(
        "DELETE FROM group_invitations WHERE group_id = ?1 AND invitee = ?2",
        params![group_id, invitee],
    )?;
    if deleted == 0 {
        return Err(RelayError::NotFound("no such invitation".into()));
    }
    Ok(())
}

/// Accept an invitation: join as `member`, removing the invitation.
pub fn accept_invitation(conn: &Connection, group_id: &str, invitee: &str) -> Result<()> {
    let group = require(conn, group_id)?;
    if member_count(conn, group_id)? >= group.settings.max_members {
        return Err(RelayError::Conflict("group is full".into()));
    }
    let tx_guard = conn.unchecked_transaction()?;
    take_invitation(conn, group_id, invitee)?;
    conn.execute(
        "INSERT INTO group_members (group_id, agent, role, joined_at) VALUES (?1, ?2, 'member', ?3)",
        params![group_id, invitee, now_epoch()],
    )?;
    record_change(conn, group_id, "member-added", Some(invitee))?;
    tx_guard.commit()?;
    Ok(())
}

/// Decline an invitation: the row is removed.
pub fn decline_invitation(conn: &Connection, group_id: &str, invitee: &str) -> Result<()> {
    take_invitation(conn, group_id, invitee)
}

/// Remove a member (leave or removal by a group admin).
pub fn remove_member(conn: &Connection, group_id: &str, agent: &str) -> Result<()> {
    let tx_guard = conn.unchecked_transaction()?;
    let deleted = conn.execute(
        "DELETE FROM group_members WHERE group_id = ?1 AND agent = ?2",
        params![group_id, agent],
    )?;
    if deleted == 0 {
        return Err(RelayError::NotFound(format!("{agent} is not a member")));
    }
    record_change(conn, group_id, "member-removed", Some(agent))?;
    tx_guard.commit()?;
    Ok(())
}

/// Transfer ownership: the old owner becomes `admin`, the new owner must
/// already be a member. Keeps the one-owner invariant inside a transaction.
pub fn transfer_ownership(conn: &Connection, group_id: &str, new_owner: &str) -> Result<()> {
    let group = require(conn, group_id)?;
    if role_of(conn, group_id, new_owner)?.is_none() {
        return Err(RelayError::NotFound(format!("{new_owner} is not a member")));
    }
    let tx_guard = conn.unchecked_transaction()?;
    conn.execute(
        "UPDATE group_members SET role = 'admin' WHERE group_id = ?1 AND agent = ?2",
        params![group_id, group.owner],
    )?;
    conn.execute(
        "UPDATE group_members SET role = 'owner' WHERE group_id = ?1 AND agent = ?2",
        params![group_id, new_owner],
    )?;
    conn.execute(
        "UPDATE groups SET owner = ?2 WHERE group_id = ?1",
        params![group_id, new_owner],
    )?;
    record_change(conn, group_id, "role-changed", Some(new_owner))?;
    tx_guard.commit()?;
    Ok(())
}

/// Dissolve a group: members removed, invitations dropped, status terminal.
pub fn dissolve(conn: &Connection, group_id: &str) -> Result<()> {
    require(conn, group_id)?;
    let tx_guard = conn.unchecked_transaction()?;
    conn.execute("DELETE FROM group_members WHERE group_id = ?1", [group_id])?;
    conn.execute(
        "DELETE FROM group_invitations WHERE group_id = ?1",
        [group_id],
    )?;
    conn.execute(
        "UPDATE groups SET status = 'dissolved' WHERE group_id = ?1",
        [group_id],
    )?;
    record_change(conn, group_id, "dissolved", None)?;
    tx_guard.commit()?;
    Ok(())
}

/// Membership mutations after `since` (epoch seconds).
pub fn changes_since(conn: &Connection, group_id: &str, since: i64) -> Result<Vec<GroupChange>> {
    let mut stmt = conn.prepare(
        "SELECT change, agent, at FROM group_changes
         WHERE group_id = ?1 AND at > ?2 ORDER BY at, id",
    )?;
    let rows = stmt
        .query_map(params![group_id, since], |row| {
            Ok(GroupChange {
                change: row.get(0)?,
                agent: row.get(1)?,
                at: epoch_to_iso(row.get(2)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{agents, open_memory};

    fn seeded() -> Connection {
        let conn = open_memory().unwrap();
        for name in ["alice", "bob", "carol"] {
            agents::insert(&conn, name, "key", "e@example.org", "https://x").unwrap();
            agents::approve(&conn, name, "admin").unwrap();
        }
        create(&conn, "g-team", "team", "alice", &GroupSettings::default()).unwrap();
        conn
    }

    #[test]
    fn test_create_adds_owner_member() {
        let conn = seeded();
        let group = require(&conn, "g-team").unwrap();
        assert_eq!(group.owner, "alice");
        assert_eq!(role_of(&conn, "g-team", "alice").unwrap(), Some(GroupRole::Owner));
        assert_eq!(member_count(&conn, "g-team").unwrap(), 1);
    }

    #[test]
    fn test_invite_accept_flow() {
        let conn = seeded();
        invite(&conn, "g-team", "bob", "alice", Some("join us")).unwrap();
        assert_eq!(invitations_for(&conn, "bob").unwrap().len(), 1);

        accept_invitation(&conn, "g-team", "bob").unwrap();
        assert_eq!(role_of(&conn, "g-team", "bob").unwrap(), Some(GroupRole::Member));
        assert!(invitations_for(&conn, "bob").unwrap().is_empty());

        // Accepted invitation is gone
        assert!(matches!(
            accept_invitation(&conn, "g-team", "bob"),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn test_invite_existing_member_conflicts() {
        let conn = seeded();
        assert!(matches!(
            invite(&conn, "g-team", "alice", "alice", None),
            Err(RelayError::Conflict(_))
        ));
    }

    #[test]
    fn test_decline_removes_invitation() {
        let conn = seeded();
        invite(&conn, "g-team", "bob", "alice", None).unwrap();
        decline_invitation(&conn, "g-team", "bob").unwrap();
        assert!(invitations_for(&conn, "bob").unwrap().is_empty());
        // Can be re-invited afterwards
        invite(&conn, "g-team", "bob", "alice", None).unwrap();
    }

    #[test]
    fn test_transfer_keeps_single_owner() {
        let conn = seeded();
        invite(&conn, "g-team", "bob", "alice", None).unwrap();
        accept_invitation(&conn, "g-team", "bob").unwrap();
        transfer_ownership(&conn, "g-team", "bob").unwrap();

        assert_eq!(require(&conn, "g-team").unwrap().owner, "bob");
        assert_eq!(role_of(&conn, "g-team", "bob").unwrap(), Some(GroupRole::Owner));
        assert_eq!(role_of(&conn, "g-team", "alice").unwrap(), Some(GroupRole::Admin));

        let owners: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = 'g-team' AND role = 'owner'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(owners, 1);
    }

    #[test]
    fn test_dissolve_clears_membership() {
        let conn = seeded();
        invite(&conn, "g-team", "bob", "alice", None).unwrap();
        dissolve(&conn, "g-team").unwrap();

        assert_eq!(require(&conn, "g-team").unwrap().status, "dissolved");
        assert_eq!(member_count(&conn, "g-team").unwrap(), 0);
        assert!(invitations_for(&conn, "bob").unwrap().is_empty());
        assert!(list_for(&conn, "alice").unwrap().is_empty());
    }

    #[test]
    fn test_change_feed() {
        let conn = seeded();
        invite(&conn, "g-team", "bob", "alice", None).unwrap();
        accept_invitation(&conn, "g-team", "bob").unwrap();
        remove_member(&conn, "g-team", "bob").unwrap();

        let changes = changes_since(&conn, "g-team", 0).unwrap();
        let kinds: Vec<&str> = changes.iter().map(|c| c.change.as_str()).collect();
        assert_eq!(kinds, vec!["member-added", "member-added", "member-removed"]);
    }

    #[test]
    fn test_max_members_validated() {
        let conn = seeded();
        let settings = GroupSettings {
            max_members: 51,
            ..GroupSettings::default()
        };
        assert!(matches!(
            create(&conn, "g-big", "big", "alice", &settings),
            Err(RelayError::Validation(_))
        ));
    }
}
