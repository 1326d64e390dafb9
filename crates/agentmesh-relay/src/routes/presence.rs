//! Presence handlers
//!
//! `online` is derived, never stored: an agent is online while its last
//! heartbeat is younger than twice the heartbeat interval.

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use agentmesh_core::relay::{HeartbeatRequest, OkResponse, PresenceInfo};

use crate::auth::authenticate_agent;
use crate::db::{agents, epoch_to_iso};
use crate::error::Result;
use crate::state::AppState;

use super::parse_json;

fn presence_of(row: &agents::AgentRow, staleness_secs: i64) -> PresenceInfo {
    PresenceInfo {
        agent: row.name.clone(),
        online: row.online(staleness_secs),
        last_seen: row.last_seen.map(epoch_to_iso),
        endpoint: row.endpoint.clone(),
    }
}

/// `PUT /presence` — heartbeat carrying the caller's endpoint URL.
pub async fn heartbeat(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "PUT", uri.path(), &headers, &body)?;
    let request: HeartbeatRequest = parse_json(&body)?;
    agents::heartbeat(&conn, &caller.name, &request.endpoint)?;
    Ok(Json(OkResponse { ok: true }))
}

/// `GET /presence/:agent`
pub async fn get_one(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(agent): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PresenceInfo>> {
    let conn = state.conn();
    authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;
    let row = agents::require(&conn, &agent)?;
    Ok(Json(presence_of(&row, state.config.presence_staleness_secs())))
}

#[derive(Deserialize)]
pub struct BatchQuery {
    agents: String,
}

/// `GET /presence/batch?agents=a,b,c` — unknown names are skipped.
pub async fn batch(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<BatchQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<PresenceInfo>>> {
    let conn = state.conn();
    authenticate_agent(&state, &conn, "GET", uri.path(), &headers, b"")?;

    let staleness = state.config.presence_staleness_secs();
    let mut out = Vec::new();
    for name in query.agents.split(',').filter(|n| !n.is_empty()) {
        if let Some(row) = agents::get(&conn, name)? {
            out.push(presence_of(&row, staleness));
        }
    }
    Ok(Json(out))
}
