//! Email verification queries
//!
//! Codes are 6 decimal digits stored as SHA-256 hex. A row expires 10
//! minutes after creation and is consumed after 3 failed attempts. A
//! `verified=1` row is the precondition for registration.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{RelayError, Result};

use super::now_epoch;

/// Code lifetime in seconds
pub const CODE_TTL_SECS: i64 = 600;
/// Maximum confirm attempts per code
pub const MAX_ATTEMPTS: i64 = 3;

/// Hash a verification code for storage or comparison.
pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Generate a random 6-digit code.
pub fn generate_code() -> String {
    use rand::Rng;
    format!("{:06}", rand::rngs::OsRng.gen_range(0..1_000_000u32))
}

/// Create or replace the verification row for `agent_name`.
pub fn issue(conn: &Connection, agent_name: &str, email: &str, code_hash: &str) -> Result<()> {
    let now = now_epoch();
    conn.execute(
        "INSERT INTO email_verifications (agent_name, email, code_hash, attempts, expires_at, verified, created_at)
         VALUES (?1, ?2, ?3, 0, ?4, 0, ?5)
         ON CONFLICT(agent_name) DO UPDATE SET
             email = ?2, code_hash = ?3, attempts = 0, expires_at = ?4, verified = 0, created_at = ?5",
        params![agent_name, email, code_hash, now + CODE_TTL_SECS, now],
    )?;
    Ok(())
}

/// Compare a submitted code against storage.
///
/// Success marks the row `verified=1`. A mismatch increments `attempts` and
/// consumes the row after the third failure. Expired codes are invalid
/// regardless of the attempt count.
pub fn confirm(conn: &Connection, agent_name: &str, code: &str) -> Result<()> {
    let row: Option<(String, i64, i64, bool)> = conn
        .query_row(
            "SELECT code_hash, attempts, expires_at, verified
             FROM email_verifications WHERE agent_name = ?1",
            [agent_name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let Some((stored_hash, attempts, expires_at, verified)) = row else {
        return Err(RelayError::NotFound("no verification in progress".into()));
    };

    if verified {
        return Ok(());
    }
    if now_epoch() > expires_at {
        return Err(RelayError::Validation("verification code expired".into()));
    }
    if attempts >= MAX_ATTEMPTS {
        return Err(RelayError::Validation("too many attempts".into()));
    }

    let submitted = hash_code(code);
    let matches: bool = submitted.as_bytes().ct_eq(stored_hash.as_bytes()).into();
    if !matches {
        let attempts = attempts + 1;
        if attempts >= MAX_ATTEMPTS {
            conn.execute(
                "DELETE FROM email_verifications WHERE agent_name = ?1",
                [agent_name],
            )?;
        } else {
            conn.execute(
                "UPDATE email_verifications SET attempts = ?2 WHERE agent_name = ?1",
                params![agent_name, attempts],
            )?;
        }
        return Err(RelayError::Validation("incorrect code".into()));
    }

    conn.execute(
        "UPDATE email_verifications SET verified = 1 WHERE agent_name = ?1",
        [agent_name],
    )?;
    Ok(())
}

/// Whether a `verified=1` row exists for this agent name.
pub fn is_verified(conn: &Connection, agent_name: &str) -> Result<bool> {
    let verified: Option<bool> = conn
        .query_row(
            "SELECT verified FROM email_verifications WHERE agent_name = ?1",
            [agent_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(verified.unwrap_or(false))
}

/// The verified email on file, used by key recovery.
pub fn verified_email(conn: &Connection, agent_name: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT email FROM email_verifications WHERE agent_name = ?1 AND verified = 1",
        [agent_name],
        |row| row.get(0),
    )
    .optional()
    .map_err(RelayError::Sqlite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory;

    #[test]
    fn test_code_shape() {
        for _ in 0..20 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_confirm_success() {
        let conn = open_memory().unwrap();
        issue(&conn, "alice", "alice@example.org", &hash_code("123456")).unwrap();
        assert!(!is_verified(&conn, "alice").unwrap());

        confirm(&conn, "alice", "123456").unwrap();
        assert!(is_verified(&conn, "alice").unwrap());
        assert_eq!(
            verified_email(&conn, "alice").unwrap().as_deref(),
            Some("alice@example.org")
        );
    }

    #[test]
    fn test_three_failures_consume_row() {
        let conn = open_memory().unwrap();
        issue(&conn, "alice", "alice@example.org", &hash_code("123456")).unwrap();

        for _ in 0..3 {
            assert!(confirm(&conn, "alice", "000000").is_err());
        }
        // Row is gone: even the correct code no longer works
        assert!(matches!(
            confirm(&conn, "alice", "123456"),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn test_expired_code_rejected() {
        let conn = open_memory().unwrap();
        issue(&conn, "alice", "alice@example.org", &hash_code("123456")).unwrap();
        conn.execute(
            "UPDATE email_verifications SET expires_at = ?1 WHERE agent_name = 'alice'",
            [now_epoch() - 1],
        )
        .unwrap();
        assert!(matches!(
            confirm(&conn, "alice", "123456"),
            Err(RelayError::Validation(_))
        ));
    }

    #[test]
    fn test_reissue_resets_attempts() {
        let conn = open_memory().unwrap();
        issue(&conn, "alice", "alice@example.org", &hash_code("111111")).unwrap();
        assert!(confirm(&conn, "alice", "000000").is_err());
        assert!(confirm(&conn, "alice", "000000").is_err());

        issue(&conn, "alice", "alice@example.org", &hash_code("222222")).unwrap();
        confirm(&conn, "alice", "222222").unwrap();
        assert!(is_verified(&conn, "alice").unwrap());
    }
}
