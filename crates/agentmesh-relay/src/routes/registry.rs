//! Agent registry handlers

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, OriginalUri, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use tracing::info;
use uuid::Uuid;

use agentmesh_core::canonical::to_canonical_string;
use agentmesh_core::identity::AgentPublicKey;
use agentmesh_core::relay::{
    AgentInfo, BroadcastKind, OkResponse, RegisterRequest, RevokeRequest,
};
use agentmesh_core::types::is_valid_username;

use crate::auth::{authenticate_admin, authenticate_agent};
use crate::db::{agents, broadcasts, verifications};
use crate::error::{RelayError, Result};
use crate::rate_limit;
use crate::state::AppState;

use super::parse_json;

fn endpoint_acceptable(endpoint: &str) -> bool {
    endpoint.starts_with("https://")
        || endpoint.starts_with("http://localhost")
        || endpoint.starts_with("http://127.0.0.1")
}

/// `POST /registry/agents` — unauthenticated, IP rate-limited. Requires a
/// prior `verified=true` email verification for the same name and email.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<Json<AgentInfo>> {
    state.breaker.check()?;
    let request: RegisterRequest = parse_json(&body)?;

    let conn = state.conn();
    rate_limit::check(
        &conn,
        &format!("reg:{}", addr.ip()),
        state.config.registrations_per_hour,
        3600,
    )?;

    if !is_valid_username(&request.name) {
        return Err(RelayError::Validation(format!(
            "invalid agent name: {:?}",
            request.name
        )));
    }
    AgentPublicKey::from_spki_base64(&request.public_key)
        .map_err(|_| RelayError::Validation("publicKey is not Ed25519 SPKI base64".into()))?;
    if !endpoint_acceptable(&request.endpoint) {
        return Err(RelayError::Validation("endpoint must be https".into()));
    }

    if agents::get(&conn, &request.name)?.is_some() {
        // Includes revoked rows: re-registration is disallowed while any row exists
        return Err(RelayError::Conflict(format!(
            "agent {} already registered",
            request.name
        )));
    }

    match verifications::verified_email(&conn, &request.name)? {
        Some(email) if email == request.owner_email => {}
        _ => {
            return Err(RelayError::Forbidden(
                "email not verified for this agent name".into(),
            ))
        }
    }

    agents::insert(
        &conn,
        &request.name,
        &request.public_key,
        &request.owner_email,
        &request.endpoint,
    )?;
    info!(agent = %request.name, "Agent registered, awaiting approval");

    Ok(Json(agents::require(&conn, &request.name)?.to_info()))
}

/// `GET /registry/agents` — authenticated listing.
pub async fn list(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<AgentInfo>>> {
    let conn = state.conn();
    authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    let rows = agents::list(&conn)?;
    Ok(Json(rows.iter().map(agents::AgentRow::to_info).collect()))
}

/// `GET /registry/agents/:name`
pub async fn get_one(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AgentInfo>> {
    let conn = state.conn();
    authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    Ok(Json(agents::require(&conn, &name)?.to_info()))
}

/// `POST /registry/agents/:name/approve` — admin only.
pub async fn approve(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let admin = authenticate_admin(&state, &conn, "POST", uri.path(), &headers, &body)?;
    agents::approve(&conn, &name, &admin)?;
    info!(agent = %name, admin = %admin, "Agent approved");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /registry/agents/:name/revoke` — admin only. Marks the agent
/// revoked (idempotent) and appends a `revocation` broadcast whose payload
/// the admin signed client-side.
pub async fn revoke(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let admin = authenticate_admin(&state, &conn, "POST", uri.path(), &headers, &body)?;
    let request: RevokeRequest = parse_json(&body)?;

    // Reconstruct the exact payload the admin signed
    let payload = to_canonical_string(&serde_json::json!({
        "revokedAgent": name,
        "revokedAt": request.revoked_at,
    }))
    .map_err(|e| RelayError::Internal(e.to_string()))?;

    let admin_key = crate::db::admins::key_for(&conn, &admin)?
        .ok_or_else(|| RelayError::Forbidden(format!("{admin} is not an admin")))?;
    AgentPublicKey::from_spki_base64(&admin_key)
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .verify_base64(payload.as_bytes(), &request.signature)
        .map_err(|_| RelayError::Auth("revocation payload signature invalid".into()))?;

    let already_revoked = matches!(
        agents::require(&conn, &name)?.status,
        agentmesh_core::relay::AgentStatus::Revoked
    );
    agents::revoke(&conn, &name)?;

    if !already_revoked {
        broadcasts::insert(
            &conn,
            &Uuid::new_v4().to_string(),
            BroadcastKind::Revocation,
            &payload,
            &admin,
            &request.signature,
        )?;
        info!(agent = %name, admin = %admin, "Agent revoked");
    }

    Ok(Json(OkResponse { ok: true }))
}
