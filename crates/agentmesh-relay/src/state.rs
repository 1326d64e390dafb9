//! Shared application state
//!
//! Everything the request-handling layer needs is carried here explicitly:
//! the database handle, configuration, the circuit breaker, and the email
//! sender. Nothing is read from ambient module state.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::config::RelayConfig;
use crate::db;
use crate::email::{CodeSender, LogCodeSender};
use crate::error::Result;
use crate::rate_limit::CircuitBreaker;

/// Cloneable handle to the relay's shared state.
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    pub config: Arc<RelayConfig>,
    pub breaker: Arc<CircuitBreaker>,
    pub mailer: Arc<dyn CodeSender>,
    pub started_at: Instant,
}

impl AppState {
    /// Open (or create) the configured database and assemble the state.
    pub fn new(config: RelayConfig, mailer: Arc<dyn CodeSender>) -> Result<Self> {
        let conn = if config.db_path.as_os_str() == ":memory:" {
            db::open_memory()?
        } else {
            db::open(&config.db_path)?
        };
        let breaker = Arc::new(CircuitBreaker::new(config.global_rate_per_min));
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
            breaker,
            mailer,
            started_at: Instant::now(),
        })
    }

    /// Test state: in-memory database, capturing defaults.
    pub fn for_tests() -> Self {
        Self::new(RelayConfig::for_tests(), Arc::new(LogCodeSender))
            .expect("in-memory state")
    }

    /// Exclusive access to the database connection. SQLite transactions are
    /// serial; handlers hold this only for the span of one operation.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock()
    }
}
