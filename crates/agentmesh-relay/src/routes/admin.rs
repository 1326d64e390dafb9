//! Admin handlers: broadcasts, pending approvals, admin keys

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::HeaderMap;
use axum::Json;
use tracing::info;
use uuid::Uuid;

use agentmesh_core::identity::AgentPublicKey;
use agentmesh_core::relay::{
    AdminKeyInfo, AgentInfo, BroadcastCreateRequest, BroadcastRecord,
};

use crate::auth::{authenticate_admin, authenticate_agent};
use crate::db::{admins, agents, broadcasts};
use crate::error::{RelayError, Result};
use crate::state::AppState;

use super::parse_json;

/// `POST /admin/broadcast` — store an admin-signed broadcast. The inner
/// `signature` covers the raw `payload` string exactly as submitted.
pub async fn create_broadcast(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BroadcastRecord>> {
    let conn = state.conn();
    let admin = authenticate_admin(&state, &conn, "POST", uri.path(), &headers, &body)?;
    let request: BroadcastCreateRequest = parse_json(&body)?;

    let admin_key = admins::key_for(&conn, &admin)?
        .ok_or_else(|| RelayError::Forbidden(format!("{admin} is not an admin")))?;
    AgentPublicKey::from_spki_base64(&admin_key)
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .verify_base64(request.payload.as_bytes(), &request.signature)
        .map_err(|_| RelayError::Auth("broadcast payload signature invalid".into()))?;

    let id = Uuid::new_v4().to_string();
    broadcasts::insert(
        &conn,
        &id,
        request.broadcast_type,
        &request.payload,
        &admin,
        &request.signature,
    )?;
    info!(id = %id, kind = request.broadcast_type.as_str(), "Broadcast stored");

    let record = broadcasts::list(&conn)?
        .into_iter()
        .find(|b| b.id == id)
        .ok_or_else(|| RelayError::Internal("broadcast vanished after insert".into()))?;
    Ok(Json(record))
}

/// `GET /admin/broadcasts` — full broadcast feed, any active agent.
pub async fn list_broadcasts(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<BroadcastRecord>>> {
    let conn = state.conn();
    authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    Ok(Json(broadcasts::list(&conn)?))
}

/// `GET /admin/pending` — agents awaiting approval, admin only.
pub async fn pending_agents(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<AgentInfo>>> {
    let conn = state.conn();
    authenticate_admin(&state, &conn, "GET", uri.path(), &headers, b"")?;
    let rows = agents::list_pending(&conn)?;
    Ok(Json(rows.iter().map(agents::AgentRow::to_info).collect()))
}

/// `GET /admin/keys` — admin public keys for client-side broadcast
/// verification; refreshed by clients on heartbeat.
pub async fn keys(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<AdminKeyInfo>>> {
    let conn = state.conn();
    authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    Ok(Json(admins::list(&conn)?))
}
