//! Legacy store-and-forward endpoints
//!
//! Kept reachable through the migration window with a `Deprecation: true`
//! header and a warning log; after the configured cutoff every call
//! answers `410 Gone`. Driven entirely by one timestamp; no per-agent
//! state.

use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::error::{RelayError, Result};
use crate::state::AppState;

fn gate(state: &AppState, endpoint: &str) -> Result<()> {
    state.breaker.check()?;
    if Utc::now() >= state.config.legacy_cutoff {
        return Err(RelayError::Gone(format!(
            "{endpoint} was removed after the migration window"
        )));
    }
    warn!(endpoint, "Deprecated relay endpoint called");
    Ok(())
}

fn deprecated(body: serde_json::Value) -> Response {
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert("Deprecation", HeaderValue::from_static("true"));
    response
}

/// `POST /relay/send` — store-and-forward is gone; messages travel
/// directly between agents now.
pub async fn send(State(state): State<AppState>) -> Result<Response> {
    gate(&state, "/relay/send")?;
    Ok(deprecated(json!({
        "accepted": false,
        "error": "store-and-forward is disabled; deliver to the recipient endpoint directly"
    })))
}

/// `GET /relay/inbox/:agent` — always empty during the window.
pub async fn inbox(State(state): State<AppState>, Path(agent): Path<String>) -> Result<Response> {
    gate(&state, "/relay/inbox")?;
    let _ = agent;
    Ok(deprecated(json!([])))
}

/// `POST /relay/inbox/:agent/ack`
pub async fn ack(State(state): State<AppState>, Path(agent): Path<String>) -> Result<Response> {
    gate(&state, "/relay/inbox/ack")?;
    let _ = agent;
    Ok(deprecated(json!({"ok": true})))
}
