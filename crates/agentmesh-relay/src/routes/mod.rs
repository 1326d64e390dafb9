//! HTTP surface
//!
//! One module per API group; all handlers extract raw bytes so the
//! signature admission in [`crate::auth`] can hash the exact body the
//! client signed.

pub mod admin;
pub mod contacts;
pub mod groups;
pub mod keys;
pub mod legacy;
pub mod presence;
pub mod registry;
pub mod verify;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;

use agentmesh_core::relay::HealthResponse;

use crate::db::agents;
use crate::error::{RelayError, Result};
use crate::state::AppState;

/// Build the full relay router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Registry
        .route("/registry/agents", post(registry::register).get(registry::list))
        .route("/registry/agents/:name", get(registry::get_one))
        .route("/registry/agents/:name/approve", post(registry::approve))
        .route("/registry/agents/:name/revoke", post(registry::revoke))
        // Contacts
        .route("/contacts/request", post(contacts::request))
        .route("/contacts/pending", get(contacts::pending))
        .route("/contacts/:agent/accept", post(contacts::accept))
        .route("/contacts/:agent/deny", post(contacts::deny))
        .route("/contacts/:agent", delete(contacts::remove))
        .route("/contacts", get(contacts::list))
        // Presence
        .route("/presence", put(presence::heartbeat))
        .route("/presence/batch", get(presence::batch))
        .route("/presence/:agent", get(presence::get_one))
        // Email verification
        .route("/verify/send", post(verify::send))
        .route("/verify/confirm", post(verify::confirm))
        // Admin
        .route("/admin/broadcast", post(admin::create_broadcast))
        .route("/admin/broadcasts", get(admin::list_broadcasts))
        .route("/admin/pending", get(admin::pending_agents))
        .route("/admin/keys", get(admin::keys))
        // Keys
        .route("/keys/rotate", post(keys::rotate))
        .route("/keys/recover", post(keys::recover))
        .route("/keys/recover/confirm", post(keys::recover_confirm))
        // Groups
        .route("/groups", post(groups::create).get(groups::list_mine))
        .route("/groups/invitations", get(groups::invitations))
        .route("/groups/:id", get(groups::get_one).delete(groups::dissolve))
        .route("/groups/:id/invite", post(groups::invite))
        .route("/groups/:id/accept", post(groups::accept))
        .route("/groups/:id/decline", post(groups::decline))
        .route("/groups/:id/leave", post(groups::leave))
        .route("/groups/:id/members", get(groups::members))
        .route("/groups/:id/members/:agent", delete(groups::remove_member))
        .route("/groups/:id/transfer", post(groups::transfer))
        .route("/groups/:id/changes", get(groups::changes))
        // Health + legacy
        .route("/health", get(health))
        .route("/relay/send", post(legacy::send))
        .route("/relay/inbox/:agent", get(legacy::inbox))
        .route("/relay/inbox/:agent/ack", post(legacy::ack))
        .with_state(state)
}

/// Decode a JSON body, mapping failures to 400.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::Validation(format!("invalid request body: {e}")))
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let agent_count = agents::count(&state.conn())?;
    Ok(Json(HealthResponse {
        name: "agentmesh-relay".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        agent_count,
    }))
}
