//! Send path and retry scanner
//!
//! A send resolves the recipient's community, loads the contact (refreshing
//! a stale cache), encrypts and signs the envelope, and either posts it
//! directly (recipient online) or enqueues it. Hard rejections (4xx) are
//! never retried.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::community::{CachedContact, Community};
use crate::crypto::{derive_pair_key, PairwiseCrypto};
use crate::envelope::{Envelope, EnvelopeKind, EnvelopePayload};
use crate::error::MeshResult;
use crate::events::DeliveryState;
use crate::identity::AgentPublicKey;
use crate::queue::{AttemptOutcome, QueuedEntry};
use crate::types::{RecipientName, SendOutcome};

use super::delivery::{post_envelope, DeliveryResult};
use super::report::DeliveryAttempt;
use super::MessagePipeline;

/// Interval between retry-queue scans
pub const SCAN_INTERVAL_SECS: u64 = 1;

impl MessagePipeline {
    /// Send a direct message to a (possibly qualified) recipient.
    ///
    /// Never returns an error: every failure mode is folded into the
    /// returned [`SendOutcome`].
    pub async fn send_message(&self, recipient: &str, payload: &Value) -> SendOutcome {
        let name = match RecipientName::parse(recipient) {
            Ok(name) => name,
            Err(e) => return SendOutcome::failed(None, e.to_string()),
        };
        let (community, username) = match self.manager.resolve(&name) {
            Ok(resolved) => resolved,
            Err(e) => return SendOutcome::failed(None, e.to_string()),
        };

        let Some(contact) = self.manager.contact_for_send(&community, &username).await else {
            return SendOutcome::failed(None, "not a contact");
        };

        let message_id = Uuid::new_v4().to_string();
        let envelope = match self.seal_envelope(
            &community,
            &contact,
            EnvelopeKind::Direct,
            message_id.clone(),
            None,
            payload,
        ) {
            Ok(envelope) => envelope,
            Err(e) => return SendOutcome::failed(Some(message_id), e.to_string()),
        };

        if !contact.online {
            debug!(recipient = %username, %message_id, "Recipient offline, queueing");
            return self.enqueue_outcome(&username, community.name(), envelope);
        }

        let Some(endpoint) = contact.endpoint.clone() else {
            return self.enqueue_outcome(&username, community.name(), envelope);
        };

        let (result, attempt) = post_envelope(&self.http, &endpoint, &envelope, None).await;
        self.reports
            .lock()
            .record_attempt(&message_id, &username, attempt);

        match result {
            DeliveryResult::Delivered(_) => {
                self.reports
                    .lock()
                    .set_final(&message_id, &username, DeliveryState::Delivered);
                SendOutcome::delivered(message_id)
            }
            DeliveryResult::Rejected(status) => {
                self.reports
                    .lock()
                    .set_final(&message_id, &username, DeliveryState::Failed);
                SendOutcome::failed(Some(message_id), format!("peer rejected with {status}"))
            }
            DeliveryResult::Transient(_) => {
                self.enqueue_outcome(&username, community.name(), envelope)
            }
        }
    }

    /// Build, encrypt, and sign one envelope for a cached contact.
    pub(crate) fn seal_envelope(
        &self,
        community: &Community,
        contact: &CachedContact,
        kind: EnvelopeKind,
        message_id: String,
        group_id: Option<String>,
        payload: &Value,
    ) -> MeshResult<Envelope> {
        let their_key = AgentPublicKey::from_spki_base64(&contact.public_key)?;
        let pair_key = derive_pair_key(
            community.keypair(),
            &self.username,
            &their_key,
            &contact.username,
        )?;

        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| crate::error::MeshError::Serialization(e.to_string()))?;
        let sealed = PairwiseCrypto::new(&pair_key).seal(&plaintext, message_id.as_bytes())?;

        let mut envelope = Envelope::with_message_id(
            kind,
            message_id,
            &self.username,
            &contact.username,
            EnvelopePayload::from_sealed(&sealed),
        );
        envelope.group_id = group_id;
        envelope.sign(community.keypair())?;
        Ok(envelope)
    }

    pub(crate) fn enqueue_outcome(
        &self,
        recipient: &str,
        community: &str,
        envelope: Envelope,
    ) -> SendOutcome {
        let message_id = envelope.message_id.clone();
        match self.queue.enqueue(recipient, community, envelope) {
            Ok(()) => SendOutcome::queued(message_id),
            Err(e) => {
                warn!(recipient, error = %e, "Could not enqueue message");
                SendOutcome::failed(Some(message_id), "queue full")
            }
        }
    }

    /// Spawn the background scanner that drives the retry queue once per
    /// second until aborted.
    pub fn spawn_retry_scanner(self: &Arc<Self>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SCAN_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pipeline.process_due().await;
            }
        })
    }

    /// One scanner pass: expire old entries, then drive every due attempt.
    pub async fn process_due(&self) {
        let scan = self.queue.scan();
        for (message_id, recipient) in scan.expired {
            self.reports
                .lock()
                .set_final(&message_id, &recipient, DeliveryState::Expired);
        }
        for entry in scan.due {
            self.attempt_queued(entry).await;
        }
    }

    async fn attempt_queued(&self, entry: QueuedEntry) {
        let Some(community) = self.manager.get(&entry.community) else {
            // The community disappeared from configuration; nothing to retry against.
            self.queue
                .complete(&entry.message_id, &entry.recipient, AttemptOutcome::Hard);
            self.reports
                .lock()
                .set_final(&entry.message_id, &entry.recipient, DeliveryState::Failed);
            return;
        };

        // Fresh presence check gates the attempt; an offline peer still
        // consumes one of the three attempts.
        let presence = self
            .manager
            .check_presence(&community, &entry.recipient)
            .await
            .ok();
        let online = presence.as_ref().map(|p| p.online);
        let endpoint = presence
            .as_ref()
            .and_then(|p| p.endpoint.clone())
            .or_else(|| {
                community
                    .cached_contact(&entry.recipient)
                    .and_then(|c| c.endpoint)
            });

        if online == Some(false) {
            self.record_skipped_attempt(&entry, Some(false), "peer offline");
            self.finish_attempt(&entry, AttemptOutcome::Transient);
            return;
        }

        let Some(endpoint) = endpoint else {
            self.record_skipped_attempt(&entry, online, "no known endpoint");
            self.finish_attempt(&entry, AttemptOutcome::Transient);
            return;
        };

        let (result, attempt) = post_envelope(&self.http, &endpoint, &entry.envelope, online).await;
        self.reports
            .lock()
            .record_attempt(&entry.message_id, &entry.recipient, attempt);

        let outcome = match result {
            DeliveryResult::Delivered(_) => AttemptOutcome::Delivered,
            DeliveryResult::Rejected(_) => AttemptOutcome::Hard,
            DeliveryResult::Transient(_) => AttemptOutcome::Transient,
        };
        self.finish_attempt(&entry, outcome);
    }

    fn record_skipped_attempt(&self, entry: &QueuedEntry, presence: Option<bool>, reason: &str) {
        self.reports.lock().record_attempt(
            &entry.message_id,
            &entry.recipient,
            DeliveryAttempt {
                timestamp: chrono::Utc::now()
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                presence_check: presence,
                endpoint: String::new(),
                http_status: None,
                error: Some(reason.to_string()),
                duration_ms: 0,
            },
        );
    }

    fn finish_attempt(&self, entry: &QueuedEntry, outcome: AttemptOutcome) {
        if let Some(state) = self
            .queue
            .complete(&entry.message_id, &entry.recipient, outcome)
        {
            self.reports
                .lock()
                .set_final(&entry.message_id, &entry.recipient, state);
        }
    }
}
