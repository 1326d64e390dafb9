//! agentmesh relay
//!
//! The coordination service for one community: identity registry, contact
//! graph, presence, admin broadcasts, email verification, key rotation and
//! recovery, and groups. The relay never carries message content; agents
//! deliver envelopes to each other directly.
//!
//! State lives in one embedded SQLite database ([`db`]); every
//! authenticated request is admitted by the signature check in [`auth`];
//! the HTTP surface is assembled in [`routes::router`].

pub mod auth;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use routes::router;
pub use state::AppState;
