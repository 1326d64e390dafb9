//! Signature-authenticated request admission
//!
//! Authenticated requests carry `Authorization: Signature <agent>:<sig>`
//! and `X-Timestamp`, signed over `"{METHOD} {PATH}\n{timestamp}\n
//! {sha256hex(body)}"`. Verification order matches the status codes the
//! API promises: unknown agent is 404, revoked/pending is 403, clock skew
//! and bad signatures are 401.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use agentmesh_core::identity::AgentPublicKey;
use agentmesh_core::relay::AgentStatus;

use crate::db::{admins, agents};
use crate::error::{RelayError, Result};
use crate::rate_limit;
use crate::state::AppState;

/// Maximum tolerated clock skew on authenticated requests
pub const MAX_SKEW_SECS: i64 = 300;

/// The canonical string a request signature covers.
pub fn signing_string(method: &str, path: &str, timestamp: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{method} {path}\n{timestamp}\n{body_hash}")
}

/// Parse `Authorization: Signature <agent>:<base64>`.
fn parse_authorization(headers: &HeaderMap) -> Result<(String, String)> {
    let header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Auth("missing Authorization header".into()))?;
    let rest = header
        .strip_prefix("Signature ")
        .ok_or_else(|| RelayError::Auth("Authorization scheme must be Signature".into()))?;
    let (agent, signature) = rest
        .split_once(':')
        .ok_or_else(|| RelayError::Auth("malformed Signature header".into()))?;
    if agent.is_empty() || signature.is_empty() {
        return Err(RelayError::Auth("malformed Signature header".into()));
    }
    Ok((agent.to_string(), signature.to_string()))
}

/// Validate `X-Timestamp` against the skew window; returns the raw value.
fn check_timestamp(headers: &HeaderMap) -> Result<String> {
    let raw = headers
        .get("X-Timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Auth("missing X-Timestamp header".into()))?;
    let ts = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| RelayError::Auth("unparseable X-Timestamp".into()))?
        .with_timezone(&Utc);
    if (Utc::now() - ts).num_seconds().abs() > MAX_SKEW_SECS {
        return Err(RelayError::Auth("request timestamp outside skew window".into()));
    }
    Ok(raw.to_string())
}

/// Admit an authenticated agent request.
///
/// Checks, in order: circuit breaker, agent exists (404), agent active
/// (403), timestamp skew (401), signature (401), then the per-agent rate
/// limit (429). A staged recovery key whose cooling-off window has passed
/// is applied before verification.
pub fn authenticate_agent(
    state: &AppState,
    conn: &Connection,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<agents::AgentRow> {
    state.breaker.check()?;

    let (name, signature) = parse_authorization(headers)?;
    let mut row = agents::require(conn, &name)?;
    match row.status {
        AgentStatus::Active => {}
        AgentStatus::Revoked => {
            return Err(RelayError::Forbidden(format!("{name} is revoked")))
        }
        AgentStatus::Pending => {
            return Err(RelayError::Forbidden(format!("{name} is not yet approved")))
        }
    }

    if agents::apply_due_recovery_key(conn, &name)? {
        row = agents::require(conn, &name)?;
    }

    let timestamp = check_timestamp(headers)?;
    let key = AgentPublicKey::from_spki_base64(&row.public_key)
        .map_err(|e| RelayError::Internal(format!("stored key unparseable: {e}")))?;
    key.verify_base64(signing_string(method, path, &timestamp, body).as_bytes(), &signature)
        .map_err(|_| RelayError::Auth("signature verification failed".into()))?;

    rate_limit::check(
        conn,
        &format!("auth:{name}"),
        state.config.auth_rate_per_min,
        60,
    )?;

    Ok(row)
}

/// Admit an admin request: the caller must hold a row in `admins` and sign
/// with the admin key, not their identity key.
pub fn authenticate_admin(
    state: &AppState,
    conn: &Connection,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String> {
    state.breaker.check()?;

    let (name, signature) = parse_authorization(headers)?;
    let Some(admin_key) = admins::key_for(conn, &name)? else {
        return Err(RelayError::Forbidden(format!("{name} is not an admin")));
    };

    let timestamp = check_timestamp(headers)?;
    let key = AgentPublicKey::from_spki_base64(&admin_key)
        .map_err(|e| RelayError::Internal(format!("stored admin key unparseable: {e}")))?;
    key.verify_base64(signing_string(method, path, &timestamp, body).as_bytes(), &signature)
        .map_err(|_| RelayError::Auth("admin signature verification failed".into()))?;

    Ok(name)
}

#[cfg(test)]
pub mod test_support {
    //! Header construction mirroring the client's signing, for tests.

    use agentmesh_core::identity::AgentKeypair;
    use axum::http::{HeaderMap, HeaderValue};
    use chrono::{SecondsFormat, Utc};

    use super::signing_string;

    pub fn signed_headers(
        keypair: &AgentKeypair,
        agent: &str,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> HeaderMap {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        signed_headers_at(keypair, agent, method, path, body, &timestamp)
    }

    pub fn signed_headers_at(
        keypair: &AgentKeypair,
        agent: &str,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: &str,
    ) -> HeaderMap {
        let signature = keypair.sign_base64(signing_string(method, path, timestamp, body).as_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Signature {agent}:{signature}")).unwrap(),
        );
        headers.insert("X-Timestamp", HeaderValue::from_str(timestamp).unwrap());
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{signed_headers, signed_headers_at};
    use super::*;
    use agentmesh_core::identity::AgentKeypair;

    fn seeded_agent(state: &AppState, name: &str) -> AgentKeypair {
        let keypair = AgentKeypair::generate();
        let conn = state.conn();
        agents::insert(
            &conn,
            name,
            &keypair.public_key().to_spki_base64(),
            "a@example.org",
            "https://x.example.org",
        )
        .unwrap();
        agents::approve(&conn, name, "admin").unwrap();
        keypair
    }

    #[test]
    fn test_valid_signature_admitted() {
        let state = AppState::for_tests();
        let keypair = seeded_agent(&state, "alice");
        let headers = signed_headers(&keypair, "alice", "GET", "/contacts", b"");
        let conn = state.conn();
        let row =
            authenticate_agent(&state, &conn, "GET", "/contacts", &headers, b"").unwrap();
        assert_eq!(row.name, "alice");
    }

    #[test]
    fn test_unknown_agent_is_404() {
        let state = AppState::for_tests();
        let keypair = AgentKeypair::generate();
        let headers = signed_headers(&keypair, "ghost", "GET", "/contacts", b"");
        let conn = state.conn();
        assert!(matches!(
            authenticate_agent(&state, &conn, "GET", "/contacts", &headers, b""),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn test_revoked_agent_is_403() {
        let state = AppState::for_tests();
        let keypair = seeded_agent(&state, "rogue");
        {
            let conn = state.conn();
            agents::revoke(&conn, "rogue").unwrap();
        }
        let headers = signed_headers(&keypair, "rogue", "GET", "/contacts", b"");
        let conn = state.conn();
        assert!(matches!(
            authenticate_agent(&state, &conn, "GET", "/contacts", &headers, b""),
            Err(RelayError::Forbidden(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_401() {
        let state = AppState::for_tests();
        let _real = seeded_agent(&state, "alice");
        let imposter = AgentKeypair::generate();
        let headers = signed_headers(&imposter, "alice", "GET", "/contacts", b"");
        let conn = state.conn();
        assert!(matches!(
            authenticate_agent(&state, &conn, "GET", "/contacts", &headers, b""),
            Err(RelayError::Auth(_))
        ));
    }

    #[test]
    fn test_stale_timestamp_is_401() {
        let state = AppState::for_tests();
        let keypair = seeded_agent(&state, "alice");
        let stale = (Utc::now() - chrono::Duration::minutes(10))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let headers = signed_headers_at(&keypair, "alice", "GET", "/contacts", b"", &stale);
        let conn = state.conn();
        assert!(matches!(
            authenticate_agent(&state, &conn, "GET", "/contacts", &headers, b""),
            Err(RelayError::Auth(_))
        ));
    }

    #[test]
    fn test_body_bound_to_signature() {
        let state = AppState::for_tests();
        let keypair = seeded_agent(&state, "alice");
        let headers = signed_headers(&keypair, "alice", "POST", "/contacts/request", b"{\"to\":\"bob\"}");
        let conn = state.conn();
        // Different body, same headers: rejected
        assert!(matches!(
            authenticate_agent(
                &state,
                &conn,
                "POST",
                "/contacts/request",
                &headers,
                b"{\"to\":\"eve\"}"
            ),
            Err(RelayError::Auth(_))
        ));
    }

    #[test]
    fn test_admin_requires_admin_key() {
        let state = AppState::for_tests();
        let agent_key = seeded_agent(&state, "root");
        let admin_key = AgentKeypair::generate();
        {
            let conn = state.conn();
            admins::add(&conn, "root", &admin_key.public_key().to_spki_base64()).unwrap();
        }

        // Signing with the identity key is not enough
        let headers = signed_headers(&agent_key, "root", "GET", "/admin/pending", b"");
        {
            let conn = state.conn();
            assert!(matches!(
                authenticate_admin(&state, &conn, "GET", "/admin/pending", &headers, b""),
                Err(RelayError::Auth(_))
            ));
        }

        // The admin key works
        let headers = signed_headers(&admin_key, "root", "GET", "/admin/pending", b"");
        let conn = state.conn();
        let name =
            authenticate_admin(&state, &conn, "GET", "/admin/pending", &headers, b"").unwrap();
        assert_eq!(name, "root");
    }

    #[test]
    fn test_non_admin_is_403() {
        let state = AppState::for_tests();
        let keypair = seeded_agent(&state, "alice");
        let headers = signed_headers(&keypair, "alice", "GET", "/admin/pending", b"");
        let conn = state.conn();
        assert!(matches!(
            authenticate_admin(&state, &conn, "GET", "/admin/pending", &headers, b""),
            Err(RelayError::Forbidden(_))
        ));
    }
}
