//! Relay configuration
//!
//! The listen port comes from `PORT`; everything else lives in this struct
//! and is injected into the request-handling layer, never read from ambient
//! process state.

use chrono::{DateTime, Duration, Utc};

/// Default listen port
pub const DEFAULT_PORT: u16 = 8420;
/// Default heartbeat interval clients are expected to honor (seconds);
/// presence staleness is twice this
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: i64 = 300;
/// Length of the legacy-endpoint migration window
pub const MIGRATION_WINDOW_DAYS: i64 = 30;

/// Relay runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen port (`PORT` environment variable)
    pub port: u16,
    /// Path to the SQLite database
    pub db_path: std::path::PathBuf,
    /// Heartbeat interval presence math is derived from
    pub heartbeat_interval_secs: i64,
    /// Instant after which legacy endpoints return 410 Gone
    pub legacy_cutoff: DateTime<Utc>,
    /// Authenticated requests per minute per agent
    pub auth_rate_per_min: u32,
    /// Contact requests per hour per agent
    pub contact_requests_per_hour: u32,
    /// Registration attempts per hour per IP
    pub registrations_per_hour: u32,
    /// Aggregate circuit-breaker: requests per minute across all callers
    pub global_rate_per_min: u64,
}

impl RelayConfig {
    /// Build a config from the process environment, with defaults for
    /// everything not set.
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let db_path = std::env::var("RELAY_DB")
            .map(Into::into)
            .unwrap_or_else(|_| "relay.db".into());
        let legacy_cutoff = std::env::var("LEGACY_CUTOFF")
            .ok()
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + Duration::days(MIGRATION_WINDOW_DAYS));

        Self {
            port,
            db_path,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            legacy_cutoff,
            auth_rate_per_min: 60,
            contact_requests_per_hour: 10,
            registrations_per_hour: 3,
            global_rate_per_min: 10_000,
        }
    }

    /// Config for tests: in-memory database, generous cutoff.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            db_path: ":memory:".into(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            legacy_cutoff: Utc::now() + Duration::days(MIGRATION_WINDOW_DAYS),
            auth_rate_per_min: 60,
            contact_requests_per_hour: 10,
            registrations_per_hour: 3,
            global_rate_per_min: 10_000,
        }
    }

    /// Seconds after the last heartbeat an agent still counts as online.
    pub fn presence_staleness_secs(&self) -> i64 {
        2 * self.heartbeat_interval_secs
    }
}
