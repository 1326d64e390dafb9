//! The message pipeline
//!
//! Send: resolve → cache lookup (with relay refresh) → pairwise encrypt →
//! sign → presence-gated direct POST or retry enqueue.
//!
//! Receive: wire-codec gates → signature verify → decrypt → dedupe → event
//! emit. Group messages additionally validate membership; broadcasts verify
//! against the cached admin keys.
//!
//! The pipeline borrows the community manager (never the other way around)
//! so both stay independently testable.

pub mod dedup;
pub mod delivery;
pub mod group;
pub mod receive;
pub mod report;
pub mod send;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::community::CommunityManager;
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::queue::RetryQueue;

pub use dedup::{DedupSet, DEDUP_CAPACITY};
pub use delivery::DeliveryResult;
pub use group::GROUP_MEMBER_CACHE_TTL_SECS;
pub use report::{DeliveryAttempt, DeliveryReport, DeliveryReportLog, REPORT_CAPACITY};

/// End-to-end message pipeline for one agent.
pub struct MessagePipeline {
    username: String,
    manager: Arc<CommunityManager>,
    queue: Arc<RetryQueue>,
    events: broadcast::Sender<MeshEvent>,
    http: reqwest::Client,
    reports: Mutex<DeliveryReportLog>,
    dedup_direct: Mutex<DedupSet>,
    dedup_group: Mutex<DedupSet>,
    dedup_broadcast: Mutex<DedupSet>,
    member_cache: Mutex<group::GroupMemberCache>,
    revoked: Mutex<HashSet<String>>,
}

impl MessagePipeline {
    /// Build a pipeline over an existing manager and retry queue.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the delivery HTTP client cannot be built.
    pub fn new(
        manager: Arc<CommunityManager>,
        queue: Arc<RetryQueue>,
        events: broadcast::Sender<MeshEvent>,
    ) -> MeshResult<Self> {
        let config = manager.config();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delivery_timeout_secs))
            .build()
            .map_err(|e| MeshError::Config(format!("failed to build delivery client: {e}")))?;

        Ok(Self {
            username: config.username.clone(),
            manager,
            queue,
            events,
            http,
            reports: Mutex::new(DeliveryReportLog::new()),
            dedup_direct: Mutex::new(DedupSet::default()),
            dedup_group: Mutex::new(DedupSet::default()),
            dedup_broadcast: Mutex::new(DedupSet::default()),
            member_cache: Mutex::new(group::GroupMemberCache::new()),
            revoked: Mutex::new(HashSet::new()),
        })
    }

    /// Our username (the `sender` of everything this pipeline emits).
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Delivery reports recorded for one message id.
    pub fn delivery_reports(&self, message_id: &str) -> Vec<DeliveryReport> {
        self.reports.lock().reports_for(message_id)
    }

    /// Whether a sender has been revoked by a consumed revocation broadcast.
    pub fn is_revoked(&self, username: &str) -> bool {
        self.revoked.lock().contains(username)
    }
}
