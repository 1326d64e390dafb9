//! Contact workflow handlers

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use tracing::info;

use agentmesh_core::relay::{AgentStatus, ContactInfo, ContactRequestBody, OkResponse, PendingContactInfo};

use crate::auth::authenticate_agent;
use crate::db::{agents, contacts};
use crate::error::{RelayError, Result};
use crate::rate_limit;
use crate::state::AppState;

use super::parse_json;

/// Maximum greeting length
pub const GREETING_MAX_LEN: usize = 500;

/// `POST /contacts/request`
pub async fn request(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    let request: ContactRequestBody = parse_json(&body)?;

    if request.to == caller.name {
        return Err(RelayError::Validation(
            "cannot request contact with yourself".into(),
        ));
    }
    if let Some(greeting) = &request.greeting {
        if greeting.len() > GREETING_MAX_LEN {
            return Err(RelayError::Validation(format!(
                "greeting exceeds {GREETING_MAX_LEN} characters"
            )));
        }
    }

    let target = agents::require(&conn, &request.to)?;
    if target.status != AgentStatus::Active {
        return Err(RelayError::NotFound(format!("unknown agent: {}", request.to)));
    }

    rate_limit::check(
        &conn,
        &format!("contact:{}", caller.name),
        state.config.contact_requests_per_hour,
        3600,
    )?;

    contacts::request(&conn, &caller.name, &request.to, request.greeting.as_deref())?;
    info!(from = %caller.name, to = %request.to, "Contact requested");
    Ok(Json(OkResponse { ok: true }))
}

/// `GET /contacts/pending` — requests addressed to the caller.
pub async fn pending(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<PendingContactInfo>>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    Ok(Json(contacts::pending_for(&conn, &caller.name)?))
}

/// `POST /contacts/:agent/accept`
pub async fn accept(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(agent): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    contacts::accept(&conn, &caller.name, &agent)?;
    info!(caller = %caller.name, peer = %agent, "Contact accepted");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /contacts/:agent/deny`
pub async fn deny(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(agent): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    contacts::deny(&conn, &caller.name, &agent)?;
    Ok(Json(OkResponse { ok: true }))
}

/// `DELETE /contacts/:agent`
pub async fn remove(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(agent): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "DELETE", uri.path(), &headers, b"")?;
    contacts::remove(&conn, &caller.name, &agent)?;
    info!(caller = %caller.name, peer = %agent, "Contact removed");
    Ok(Json(OkResponse { ok: true }))
}

/// `GET /contacts` — the caller's active contacts with presence.
pub async fn list(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<Vec<ContactInfo>>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    Ok(Json(contacts::list_for(
        &conn,
        &caller.name,
        state.config.presence_staleness_secs(),
    )?))
}
