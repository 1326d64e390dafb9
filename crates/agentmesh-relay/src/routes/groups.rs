//! Group handlers
//!
//! Permission model: the owner may do everything; group admins may invite
//! and remove members; plain members may invite only when the group's
//! `membersCanInvite` setting allows it. Nobody removes the owner; an
//! owner leaves by transferring or dissolving.

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use agentmesh_core::relay::{
    AgentStatus, CreateGroupRequest, GroupChange, GroupInfo, GroupInvitationInfo,
    GroupInviteRequest, GroupMemberInfo, GroupRole, OkResponse, TransferOwnershipRequest,
};

use crate::auth::authenticate_agent;
use crate::db::{agents, groups, iso_to_epoch};
use crate::error::{RelayError, Result};
use crate::state::AppState;

use super::parse_json;

fn require_role(
    conn: &rusqlite::Connection,
    group_id: &str,
    agent: &str,
) -> Result<GroupRole> {
    groups::role_of(conn, group_id, agent)?
        .ok_or_else(|| RelayError::Forbidden(format!("{agent} is not a member of {group_id}")))
}

/// `POST /groups`
pub async fn create(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<GroupInfo>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    let request: CreateGroupRequest = parse_json(&body)?;

    if request.name.is_empty() || request.name.len() > 64 {
        return Err(RelayError::Validation("group name must be 1-64 characters".into()));
    }

    let group_id = Uuid::new_v4().to_string();
    let settings = request.settings.unwrap_or_default();
    groups::create(&conn, &group_id, &request.name, &caller.name, &settings)?;
    info!(group_id = %group_id, owner = %caller.name, "Group created");
    Ok(Json(groups::require(&conn, &group_id)?))
}

/// `GET /groups` — groups the caller belongs to.
pub async fn list_mine(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupInfo>>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    Ok(Json(groups::list_for(&conn, &caller.name)?))
}

/// `GET /groups/:id`
pub async fn get_one(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GroupInfo>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    require_role(&conn, &group_id, &caller.name)?;
    Ok(Json(groups::require(&conn, &group_id)?))
}

/// `DELETE /groups/:id` — owner only.
pub async fn dissolve(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "DELETE", uri.path(), &headers, b"")?;
    if require_role(&conn, &group_id, &caller.name)? != GroupRole::Owner {
        return Err(RelayError::Forbidden("only the owner may dissolve a group".into()));
    }
    groups::dissolve(&conn, &group_id)?;
    info!(group_id = %group_id, "Group dissolved");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /groups/:id/invite`
pub async fn invite(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    let request: GroupInviteRequest = parse_json(&body)?;

    let group = groups::require(&conn, &group_id)?;
    if group.status != "active" {
        return Err(RelayError::Conflict("group is dissolved".into()));
    }
    let role = require_role(&conn, &group_id, &caller.name)?;
    if role == GroupRole::Member && !group.settings.members_can_invite {
        return Err(RelayError::Forbidden("members may not invite in this group".into()));
    }

    let invitee = agents::require(&conn, &request.invitee)?;
    if invitee.status != AgentStatus::Active {
        return Err(RelayError::NotFound(format!("unknown agent: {}", request.invitee)));
    }
    if groups::member_count(&conn, &group_id)? >= group.settings.max_members {
        return Err(RelayError::Conflict("group is full".into()));
    }

    groups::invite(&conn, &group_id, &request.invitee, &caller.name, request.greeting.as_deref())?;
    info!(group_id = %group_id, invitee = %request.invitee, "Group invitation sent");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /groups/:id/accept`
pub async fn accept(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    groups::accept_invitation(&conn, &group_id, &caller.name)?;
    info!(group_id = %group_id, agent = %caller.name, "Group invitation accepted");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /groups/:id/decline`
pub async fn decline(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    groups::decline_invitation(&conn, &group_id, &caller.name)?;
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /groups/:id/leave` — any member except the owner.
pub async fn leave(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    if require_role(&conn, &group_id, &caller.name)? == GroupRole::Owner {
        return Err(RelayError::Conflict(
            "the owner must transfer ownership or dissolve the group".into(),
        ));
    }
    groups::remove_member(&conn, &group_id, &caller.name)?;
    Ok(Json(OkResponse { ok: true }))
}

/// `GET /groups/:id/members` — member only.
pub async fn members(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupMemberInfo>>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    require_role(&conn, &group_id, &caller.name)?;
    Ok(Json(groups::members(
        &conn,
        &group_id,
        state.config.presence_staleness_secs(),
    )?))
}

/// `DELETE /groups/:id/members/:agent` — owner or group admin; the owner
/// cannot be removed.
pub async fn remove_member(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path((group_id, agent)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "DELETE", uri.path(), &headers, b"")?;
    let caller_role = require_role(&conn, &group_id, &caller.name)?;
    if caller_role == GroupRole::Member {
        return Err(RelayError::Forbidden("only owner or admins may remove members".into()));
    }
    if groups::role_of(&conn, &group_id, &agent)? == Some(GroupRole::Owner) {
        return Err(RelayError::Conflict("the owner cannot be removed".into()));
    }
    groups::remove_member(&conn, &group_id, &agent)?;
    info!(group_id = %group_id, agent = %agent, "Group member removed");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /groups/:id/transfer` — owner only.
pub async fn transfer(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    let request: TransferOwnershipRequest = parse_json(&body)?;
    if require_role(&conn, &group_id, &caller.name)? != GroupRole::Owner {
        return Err(RelayError::Forbidden("only the owner may transfer ownership".into()));
    }
    groups::transfer_ownership(&conn, &group_id, &request.new_owner)?;
    info!(group_id = %group_id, new_owner = %request.new_owner, "Group ownership transferred");
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Deserialize)]
pub struct ChangesQuery {
    since: Option<String>,
}

/// `GET /groups/:id/changes?since=<iso>` — membership mutations for the
/// client member-cache refresh.
pub async fn changes(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
    Query(query): Query<ChangesQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupChange>>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    require_role(&conn, &group_id, &caller.name)?;

    let since = match query.since.as_deref() {
        Some(iso) => iso_to_epoch(iso)
            .ok_or_else(|| RelayError::Validation("unparseable since timestamp".into()))?,
        None => 0,
    };
    Ok(Json(groups::changes_since(&conn, &group_id, since)?))
}

/// `GET /groups/invitations` — invitations addressed to the caller.
pub async fn invitations(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupInvitationInfo>>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    Ok(Json(groups::invitations_for(&conn, &caller.name)?))
}
