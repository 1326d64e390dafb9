//! Rate limiting
//!
//! Per-caller limits use fixed windows persisted in the `rate_limits`
//! table: one row per (bucket, window). The aggregate circuit breaker is a
//! process-wide in-memory counter, injected into the handler layer through
//! [`crate::state::AppState`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rusqlite::{params, Connection};

use crate::db::now_epoch;
use crate::error::{RelayError, Result};

/// Remaining allowance after a successful check.
#[derive(Debug, Clone, Copy)]
pub struct RateStatus {
    pub remaining: u32,
    pub reset_secs: u64,
}

/// Count one hit on `bucket` within a fixed window.
///
/// # Errors
///
/// `RateLimited` once the window's count exceeds `limit`.
pub fn check(conn: &Connection, bucket: &str, limit: u32, window_secs: i64) -> Result<RateStatus> {
    let now = now_epoch();
    let window_start = now - now.rem_euclid(window_secs);
    let reset_secs = (window_start + window_secs - now) as u64;

    let count: i64 = conn.query_row(
        "INSERT INTO rate_limits (bucket, window_start, count) VALUES (?1, ?2, 1)
         ON CONFLICT(bucket, window_start) DO UPDATE SET count = count + 1
         RETURNING count",
        params![bucket, window_start],
        |row| row.get(0),
    )?;

    // Opportunistic cleanup of windows nobody will read again
    conn.execute(
        "DELETE FROM rate_limits WHERE bucket = ?1 AND window_start < ?2",
        params![bucket, window_start],
    )?;

    if count > limit as i64 {
        return Err(RelayError::RateLimited {
            remaining: 0,
            reset_secs,
        });
    }
    Ok(RateStatus {
        remaining: limit - count as u32,
        reset_secs,
    })
}

/// Process-wide circuit breaker: caps total requests per minute.
pub struct CircuitBreaker {
    limit: u64,
    window_start: AtomicI64,
    count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            window_start: AtomicI64::new(now_epoch() / 60),
            count: AtomicU64::new(0),
        }
    }

    /// Count one request.
    ///
    /// # Errors
    ///
    /// `RateLimited` once the minute's aggregate exceeds the cap.
    pub fn check(&self) -> Result<()> {
        let minute = now_epoch() / 60;
        let previous = self.window_start.swap(minute, Ordering::Relaxed);
        if previous != minute {
            self.count.store(0, Ordering::Relaxed);
        }
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.limit {
            let reset_secs = (60 - now_epoch().rem_euclid(60)) as u64;
            return Err(RelayError::RateLimited {
                remaining: 0,
                reset_secs,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory;

    #[test]
    fn test_window_counting() {
        let conn = open_memory().unwrap();
        for i in 0..3 {
            let status = check(&conn, "auth:alice", 3, 60).unwrap();
            assert_eq!(status.remaining, 2 - i);
        }
        assert!(matches!(
            check(&conn, "auth:alice", 3, 60),
            Err(RelayError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_buckets_independent() {
        let conn = open_memory().unwrap();
        for _ in 0..3 {
            check(&conn, "auth:alice", 3, 60).unwrap();
        }
        assert!(check(&conn, "auth:bob", 3, 60).is_ok());
    }

    #[test]
    fn test_circuit_breaker_trips() {
        let breaker = CircuitBreaker::new(5);
        for _ in 0..5 {
            breaker.check().unwrap();
        }
        assert!(matches!(
            breaker.check(),
            Err(RelayError::RateLimited { .. })
        ));
    }
}
