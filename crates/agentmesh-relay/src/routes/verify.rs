//! Email verification handlers

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use tracing::info;

use agentmesh_core::relay::{OkResponse, VerifyConfirmRequest, VerifySendRequest};
use agentmesh_core::types::is_valid_username;

use crate::db::verifications;
use crate::error::{RelayError, Result};
use crate::state::AppState;

use super::parse_json;

/// `POST /verify/send` — issue a 6-digit code for a prospective agent name
/// and dispatch it through the external email sender.
pub async fn send(State(state): State<AppState>, body: Bytes) -> Result<Json<OkResponse>> {
    state.breaker.check()?;
    let request: VerifySendRequest = parse_json(&body)?;

    if !is_valid_username(&request.username) {
        return Err(RelayError::Validation(format!(
            "invalid agent name: {:?}",
            request.username
        )));
    }
    if !request.email.contains('@') {
        return Err(RelayError::Validation("invalid email address".into()));
    }

    let code = verifications::generate_code();
    {
        let conn = state.conn();
        verifications::issue(
            &conn,
            &request.username,
            &request.email,
            &verifications::hash_code(&code),
        )?;
    }

    state
        .mailer
        .send_code(&request.email, &code)
        .map_err(RelayError::Internal)?;
    info!(username = %request.username, "Verification code sent");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /verify/confirm` — compare a submitted code against storage.
pub async fn confirm(State(state): State<AppState>, body: Bytes) -> Result<Json<OkResponse>> {
    state.breaker.check()?;
    let request: VerifyConfirmRequest = parse_json(&body)?;

    let conn = state.conn();
    verifications::confirm(&conn, &request.username, &request.code)?;
    info!(username = %request.username, "Email verified");
    Ok(Json(OkResponse { ok: true }))
}
