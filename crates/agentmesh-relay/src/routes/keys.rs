//! Key rotation and recovery handlers

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::HeaderMap;
use axum::Json;
use tracing::info;

use agentmesh_core::identity::AgentPublicKey;
use agentmesh_core::relay::{
    OkResponse, RecoverConfirmRequest, RecoverKeyRequest, RecoveryStatus, RotateKeyRequest,
};

use crate::auth::authenticate_agent;
use crate::db::{agents, epoch_to_iso, now_epoch, verifications};
use crate::error::{RelayError, Result};
use crate::state::AppState;

use super::parse_json;

/// Cooling-off window before a recovered key takes effect
pub const RECOVERY_COOLDOWN_SECS: i64 = 3600;

fn validate_key(encoded: &str) -> Result<()> {
    AgentPublicKey::from_spki_base64(encoded)
        .map(|_| ())
        .map_err(|_| RelayError::Validation("newPublicKey is not Ed25519 SPKI base64".into()))
}

/// `POST /keys/rotate` — replace the caller's key, authenticated with the
/// current (old) key.
pub async fn rotate(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>> {
    let conn = state.conn();
    let caller = authenticate_agent(&state, &conn, "POST", uri.path(), &headers, &body)?;
    let request: RotateKeyRequest = parse_json(&body)?;
    validate_key(&request.new_public_key)?;

    agents::rotate_key(&conn, &caller.name, &request.new_public_key)?;
    info!(agent = %caller.name, "Agent key rotated");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /keys/recover` — begin email-verified recovery. Unauthenticated:
/// the caller lost the key this relay knows. Issues a verification code to
/// the agent's registered email.
pub async fn recover(State(state): State<AppState>, body: Bytes) -> Result<Json<OkResponse>> {
    state.breaker.check()?;
    let request: RecoverKeyRequest = parse_json(&body)?;
    validate_key(&request.new_public_key)?;

    let conn = state.conn();
    let row = agents::list(&conn)?
        .into_iter()
        .find(|a| a.owner_email == request.email)
        .ok_or_else(|| RelayError::NotFound("no agent registered for this email".into()))?;

    let code = verifications::generate_code();
    verifications::issue(
        &conn,
        &row.name,
        &request.email,
        &verifications::hash_code(&code),
    )?;
    state
        .mailer
        .send_code(&request.email, &code)
        .map_err(RelayError::Internal)?;
    info!(agent = %row.name, "Key recovery started");
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /keys/recover/confirm` — confirm the emailed code and stage the
/// new key behind the one-hour cooling-off window.
pub async fn recover_confirm(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RecoveryStatus>> {
    state.breaker.check()?;
    let request: RecoverConfirmRequest = parse_json(&body)?;
    validate_key(&request.new_public_key)?;

    let conn = state.conn();
    verifications::confirm(&conn, &request.username, &request.code)?;

    let effective_at = now_epoch() + RECOVERY_COOLDOWN_SECS;
    agents::stage_recovery_key(&conn, &request.username, &request.new_public_key, effective_at)?;
    info!(agent = %request.username, "Recovery key staged");

    Ok(Json(RecoveryStatus {
        username: request.username,
        effective_at: epoch_to_iso(effective_at),
        applied: false,
    }))
}
