//! Relay API request and response types
//!
//! These are the JSON bodies of the relay HTTP surface. The relay crate
//! reuses them so client and server cannot drift.

use serde::{Deserialize, Serialize};

/// Agent lifecycle status on a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Active,
    Revoked,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Active => "active",
            AgentStatus::Revoked => "revoked",
        }
    }
}

/// Enumerated broadcast types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastKind {
    SecurityAlert,
    Maintenance,
    Update,
    Announcement,
    Revocation,
}

impl BroadcastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastKind::SecurityAlert => "security-alert",
            BroadcastKind::Maintenance => "maintenance",
            BroadcastKind::Update => "update",
            BroadcastKind::Announcement => "announcement",
            BroadcastKind::Revocation => "revocation",
        }
    }

    /// Parse a wire tag back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "security-alert" => Some(BroadcastKind::SecurityAlert),
            "maintenance" => Some(BroadcastKind::Maintenance),
            "update" => Some(BroadcastKind::Update),
            "announcement" => Some(BroadcastKind::Announcement),
            "revocation" => Some(BroadcastKind::Revocation),
            _ => None,
        }
    }
}

/// Generic `{"error": "..."}` body returned on failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Generic success acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub public_key: String,
    pub owner_email: String,
    pub endpoint: String,
}

/// Public view of an agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_updated_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestBody {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

/// A pending contact request, as seen by the recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingContactInfo {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    pub requested_at: String,
}

/// An accepted contact joined against the agents table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub agent: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub since: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_updated_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub agent: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

// ---------------------------------------------------------------------------
// Email verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySendRequest {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyConfirmRequest {
    pub username: String,
    pub code: String,
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

/// Request to create a broadcast. `payload` is the raw JSON string the admin
/// signed; the relay verifies `signature` over exactly those bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastCreateRequest {
    #[serde(rename = "type")]
    pub broadcast_type: BroadcastKind,
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub broadcast_type: BroadcastKind,
    pub payload: String,
    pub sender: String,
    pub signature: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminKeyInfo {
    pub agent: String,
    pub public_key: String,
}

/// Request to revoke an agent. The payload the admin signed is the canonical
/// JSON `{"revokedAgent": ..., "revokedAt": ...}`, reproduced by the relay
/// from the path parameter and `revoked_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    pub revoked_at: String,
    pub signature: String,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKeyRequest {
    pub new_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverKeyRequest {
    pub email: String,
    pub new_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverConfirmRequest {
    pub username: String,
    pub code: String,
    pub new_public_key: String,
}

/// Where a recovery stands after a confirm call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    pub username: String,
    /// When the cooling-off window ends and the new key takes effect
    pub effective_at: String,
    pub applied: bool,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    Member,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Owner => "owner",
            GroupRole::Admin => "admin",
            GroupRole::Member => "member",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    pub members_can_invite: bool,
    pub members_can_send: bool,
    pub max_members: u32,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            members_can_invite: false,
            members_can_send: true,
            max_members: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
    pub owner: String,
    pub status: String,
    pub settings: GroupSettings,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberInfo {
    pub agent: String,
    pub role: GroupRole,
    pub joined_at: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInvitationInfo {
    pub group_id: String,
    pub invitee: String,
    pub invited_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GroupSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInviteRequest {
    pub invitee: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOwnershipRequest {
    pub new_owner: String,
}

/// A membership mutation, returned by the group change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChange {
    pub change: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub at: String,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub name: String,
    pub version: String,
    pub uptime_secs: u64,
    pub agent_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_kind_wire_tags() {
        assert_eq!(
            serde_json::to_string(&BroadcastKind::SecurityAlert).unwrap(),
            "\"security-alert\""
        );
        assert_eq!(BroadcastKind::parse("revocation"), Some(BroadcastKind::Revocation));
        assert_eq!(BroadcastKind::parse("newsletter"), None);
    }

    #[test]
    fn test_agent_status_roundtrip() {
        for status in [AgentStatus::Pending, AgentStatus::Active, AgentStatus::Revoked] {
            let json = serde_json::to_string(&status).unwrap();
            let back: AgentStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(status, back);
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_group_settings_defaults() {
        let settings = GroupSettings::default();
        assert!(!settings.members_can_invite);
        assert!(settings.members_can_send);
        assert_eq!(settings.max_members, 50);
    }

    #[test]
    fn test_broadcast_request_type_field() {
        let req = BroadcastCreateRequest {
            broadcast_type: BroadcastKind::Maintenance,
            payload: "{}".to_string(),
            signature: "sig".to_string(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "maintenance");
    }
}
