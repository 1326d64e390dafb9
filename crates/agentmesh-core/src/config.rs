//! Client runtime configuration
//!
//! Parsed by the host application (YAML handling is outside this crate) and
//! handed in as a plain struct. Every tunable the runtime consults lives
//! here; nothing is read from ambient process state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::types::validate_username;

/// Default heartbeat interval (5 minutes)
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 300;
/// Default consecutive-failure count that trips failover
pub const DEFAULT_FAILOVER_THRESHOLD: u32 = 3;
/// Failure count that trips failover before the first successful call
pub const DEFAULT_STARTUP_FAILOVER_THRESHOLD: u32 = 1;
/// Default retry queue capacity
pub const DEFAULT_RETRY_QUEUE_MAX: usize = 100;
/// Default hard timeout for P2P delivery and relay calls (seconds)
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 5;
/// Default contact-cache staleness threshold (seconds)
pub const DEFAULT_CACHE_STALE_SECS: u64 = 300;

/// One community: a relay pair and an optional per-community identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityConfig {
    /// Community name (unique within this config)
    pub name: String,
    /// Primary relay base URL, e.g. `https://relay.example.org`
    pub api: String,
    /// Optional failover relay base URL
    #[serde(default)]
    pub failover_api: Option<String>,
    /// Per-community private key (base64 PKCS#8) overriding the top-level key
    #[serde(default)]
    pub private_key: Option<String>,
}

/// Complete client runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    /// Our agent username
    pub username: String,
    /// Top-level private key (base64 PKCS#8)
    pub private_key: String,
    /// Our public HTTPS inbox URL, advertised via heartbeats
    pub endpoint: String,
    /// Directory for per-community contact caches
    pub data_dir: PathBuf,
    /// Communities we participate in; the first is the default
    pub communities: Vec<CommunityConfig>,
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive failures before flipping to the failover relay
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,
    /// Failure count that trips failover before the first success
    #[serde(default = "default_startup_failover_threshold")]
    pub startup_failover_threshold: u32,
    /// Retry queue capacity
    #[serde(default = "default_retry_queue_max")]
    pub retry_queue_max: usize,
    /// Hard timeout for direct P2P delivery, in seconds
    #[serde(default = "default_call_timeout")]
    pub delivery_timeout_secs: u64,
    /// Hard timeout for authenticated relay calls, in seconds
    #[serde(default = "default_call_timeout")]
    pub relay_timeout_secs: u64,
    /// Contact-cache entries older than this trigger a relay refresh on send
    #[serde(default = "default_cache_stale")]
    pub cache_stale_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_failover_threshold() -> u32 {
    DEFAULT_FAILOVER_THRESHOLD
}
fn default_startup_failover_threshold() -> u32 {
    DEFAULT_STARTUP_FAILOVER_THRESHOLD
}
fn default_retry_queue_max() -> usize {
    DEFAULT_RETRY_QUEUE_MAX
}
fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}
fn default_cache_stale() -> u64 {
    DEFAULT_CACHE_STALE_SECS
}

impl MeshConfig {
    /// Validate the configuration before the engine starts.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an empty community list or duplicate community
    /// names, `Validation` for a malformed username.
    pub fn validate(&self) -> MeshResult<()> {
        validate_username(&self.username)?;
        if self.communities.is_empty() {
            return Err(MeshError::Config(
                "at least one community is required".to_string(),
            ));
        }
        for (i, community) in self.communities.iter().enumerate() {
            if community.name.is_empty() {
                return Err(MeshError::Config(format!("community {i} has no name")));
            }
            if self.communities[..i].iter().any(|c| c.name == community.name) {
                return Err(MeshError::Config(format!(
                    "duplicate community name: {}",
                    community.name
                )));
            }
        }
        Ok(())
    }

    /// Name of the default community (the first configured).
    pub fn default_community(&self) -> &str {
        &self.communities[0].name
    }
}
