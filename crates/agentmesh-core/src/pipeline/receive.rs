//! Receive path
//!
//! Every inbound envelope passes the wire-codec gates, then dispatches on
//! its type tag. Verification failures are errors (the transport layer
//! answers 400); duplicates return silently without emitting.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::community::Community;
use crate::crypto::{derive_pair_key, PairwiseCrypto};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::identity::AgentPublicKey;
use crate::relay::{BroadcastKind, BroadcastRecord};

use super::MessagePipeline;

impl MessagePipeline {
    /// Process one envelope from our HTTPS inbox.
    ///
    /// # Errors
    ///
    /// Any validation, signature, or decryption failure; the transport layer
    /// maps errors to a 400 response.
    pub async fn receive_envelope(&self, envelope: Envelope) -> MeshResult<()> {
        envelope.validate_version()?;
        envelope.validate_recipient(&self.username)?;
        envelope.validate_timestamp(Utc::now())?;

        if self.is_revoked(&envelope.sender) {
            return Err(MeshError::Auth(format!(
                "sender {} has been revoked",
                envelope.sender
            )));
        }

        match envelope.kind {
            EnvelopeKind::Direct => self.receive_direct(envelope).await,
            EnvelopeKind::Group => self.receive_group(envelope).await,
            EnvelopeKind::Broadcast | EnvelopeKind::Revocation => {
                self.receive_broadcast_envelope(envelope)
            }
            EnvelopeKind::ContactRequest => self.receive_contact_request(envelope),
            EnvelopeKind::ContactResponse | EnvelopeKind::Receipt => {
                self.receive_ack(envelope).await
            }
        }
    }

    /// Resolve the sender's community and published key, refreshing the
    /// community's contacts once if the key is missing, then verify the
    /// envelope signature.
    async fn verify_sender(&self, envelope: &Envelope) -> MeshResult<Arc<Community>> {
        let community = self
            .manager
            .community_of_peer(&envelope.sender)
            .unwrap_or_else(|| self.manager.default_community());

        let Some(key_b64) = self
            .manager
            .sender_public_key(&community, &envelope.sender)
            .await
        else {
            return Err(MeshError::Auth(format!(
                "no public key known for sender {}",
                envelope.sender
            )));
        };

        let key = AgentPublicKey::from_spki_base64(&key_b64)?;
        envelope.verify_signature(&key)?;
        Ok(community)
    }

    /// Decrypt a sealed payload with the pairwise key for this sender.
    fn open_payload(&self, community: &Community, envelope: &Envelope) -> MeshResult<Value> {
        let contact = community.cached_contact(&envelope.sender).ok_or_else(|| {
            MeshError::Auth(format!("sender {} is not a contact", envelope.sender))
        })?;
        let their_key = AgentPublicKey::from_spki_base64(&contact.public_key)?;
        let pair_key = derive_pair_key(
            community.keypair(),
            &self.username,
            &their_key,
            &envelope.sender,
        )?;

        let sealed = envelope.payload.to_sealed()?;
        let plaintext = PairwiseCrypto::new(&pair_key).open(
            &sealed.ciphertext,
            &sealed.nonce,
            envelope.message_id.as_bytes(),
        )?;
        serde_json::from_slice(&plaintext).map_err(|e| MeshError::Serialization(e.to_string()))
    }

    async fn receive_direct(&self, envelope: Envelope) -> MeshResult<()> {
        let community = self.verify_sender(&envelope).await?;

        if !self.dedup_direct.lock().insert(&envelope.message_id) {
            debug!(message_id = %envelope.message_id, "Duplicate direct message dropped");
            return Ok(());
        }

        let payload = self.open_payload(&community, &envelope)?;
        info!(sender = %envelope.sender, message_id = %envelope.message_id, "Message received");
        let _ = self.events.send(MeshEvent::Message {
            sender: envelope.sender,
            message_id: envelope.message_id,
            timestamp: envelope.timestamp,
            payload,
            verified: true,
        });
        Ok(())
    }

    async fn receive_group(&self, envelope: Envelope) -> MeshResult<()> {
        let group_id = envelope
            .group_id
            .clone()
            .ok_or_else(|| MeshError::Validation("group envelope missing groupId".into()))?;

        let community = self.verify_sender(&envelope).await?;

        if !self
            .confirm_group_member(&community, &group_id, &envelope.sender)
            .await
        {
            return Err(MeshError::Auth(format!(
                "{} is not a member of group {group_id}",
                envelope.sender
            )));
        }

        if !self.dedup_group.lock().insert(&envelope.message_id) {
            debug!(message_id = %envelope.message_id, "Duplicate group message dropped");
            return Ok(());
        }

        let payload = self.open_payload(&community, &envelope)?;
        let _ = self.events.send(MeshEvent::GroupMessage {
            sender: envelope.sender,
            group_id,
            message_id: envelope.message_id,
            timestamp: envelope.timestamp,
            payload,
        });
        Ok(())
    }

    /// Broadcast and revocation envelopes are signed by an admin key, not a
    /// contact key; verification runs against the cached admin keys of every
    /// community.
    fn receive_broadcast_envelope(&self, envelope: Envelope) -> MeshResult<()> {
        let verified = self.manager.communities().iter().any(|community| {
            community
                .admin_public_keys()
                .iter()
                .any(|key| envelope.verify_signature(key).is_ok())
        });
        if !verified {
            return Err(MeshError::SignatureInvalid(
                "broadcast not signed by a known admin key".into(),
            ));
        }

        if !self.dedup_broadcast.lock().insert(&envelope.message_id) {
            return Ok(());
        }

        let payload = match &envelope.payload {
            crate::envelope::EnvelopePayload::Plain(value) => value.clone(),
            _ => {
                return Err(MeshError::Validation(
                    "broadcast payload must be plain JSON".into(),
                ))
            }
        };

        let broadcast_type = if envelope.kind == EnvelopeKind::Revocation {
            self.apply_revocation(&payload);
            "revocation".to_string()
        } else {
            payload
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("announcement")
                .to_string()
        };

        let _ = self.events.send(MeshEvent::Broadcast {
            id: envelope.message_id,
            broadcast_type,
            sender: envelope.sender,
            payload,
        });
        Ok(())
    }

    /// Contact requests arrive before any contact exists, so the sender's
    /// key travels in the payload and the relay registry is the trust root.
    /// The request is surfaced as an event; nothing is auto-accepted.
    fn receive_contact_request(&self, envelope: Envelope) -> MeshResult<()> {
        let payload = match &envelope.payload {
            crate::envelope::EnvelopePayload::Plain(value) => value.clone(),
            _ => {
                return Err(MeshError::Validation(
                    "contact-request payload must be plain JSON".into(),
                ))
            }
        };

        let key_b64 = payload
            .get("publicKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                MeshError::Validation("contact-request missing publicKey".into())
            })?;
        let key = AgentPublicKey::from_spki_base64(key_b64)?;
        envelope.verify_signature(&key)?;

        if !self.dedup_direct.lock().insert(&envelope.message_id) {
            return Ok(());
        }

        let community = self
            .manager
            .community_of_peer(&envelope.sender)
            .unwrap_or_else(|| self.manager.default_community());

        info!(from = %envelope.sender, "Contact request received");
        let _ = self.events.send(MeshEvent::ContactRequest {
            community: community.name().to_string(),
            from: envelope.sender,
            greeting: payload
                .get("greeting")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            public_key: key_b64.to_string(),
        });
        Ok(())
    }

    /// Receipts and contact responses are verified and deduplicated but
    /// produce no event of their own.
    async fn receive_ack(&self, envelope: Envelope) -> MeshResult<()> {
        self.verify_sender(&envelope).await?;
        if self.dedup_direct.lock().insert(&envelope.message_id) {
            debug!(kind = ?envelope.kind, sender = %envelope.sender, "Acknowledgement consumed");
        }
        Ok(())
    }

    /// Verify and consume one broadcast record fetched from a relay.
    /// Returns `true` when the record was new and an event was emitted.
    pub fn handle_broadcast_record(
        &self,
        community: &Arc<Community>,
        record: BroadcastRecord,
    ) -> MeshResult<bool> {
        let keys = community.admin_public_keys();
        if keys.is_empty() {
            return Err(MeshError::Auth(
                "no admin keys cached for this community".into(),
            ));
        }
        let verified = keys
            .iter()
            .any(|key| key.verify_base64(record.payload.as_bytes(), &record.signature).is_ok());
        if !verified {
            return Err(MeshError::SignatureInvalid(
                "broadcast not signed by a known admin key".into(),
            ));
        }

        if !self.dedup_broadcast.lock().insert(&record.id) {
            return Ok(false);
        }

        let payload: Value = serde_json::from_str(&record.payload)
            .unwrap_or_else(|_| Value::String(record.payload.clone()));

        if record.broadcast_type == BroadcastKind::Revocation {
            self.apply_revocation(&payload);
        }

        let _ = self.events.send(MeshEvent::Broadcast {
            id: record.id,
            broadcast_type: record.broadcast_type.as_str().to_string(),
            sender: record.sender,
            payload,
        });
        Ok(true)
    }

    fn apply_revocation(&self, payload: &Value) {
        if let Some(name) = payload.get("revokedAgent").and_then(|v| v.as_str()) {
            warn!(agent = name, "Agent revoked; rejecting future messages");
            self.revoked.lock().insert(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::{CachedContact, CommunityManager};
    use crate::config::{CommunityConfig, MeshConfig};
    use crate::crypto::derive_pair_key;
    use crate::envelope::EnvelopePayload;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use crate::identity::AgentKeypair;
    use crate::queue::RetryQueue;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Harness {
        pipeline: Arc<MessagePipeline>,
        events: broadcast::Receiver<MeshEvent>,
        manager: Arc<CommunityManager>,
        _dir: TempDir,
    }

    /// Build a pipeline for `bob` whose relay is unreachable, so every test
    /// runs purely against seeded cache state.
    fn harness(bob: &AgentKeypair) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = MeshConfig {
            username: "bob".to_string(),
            private_key: bob.to_pkcs8_base64(),
            endpoint: "https://bob.example.org/inbox".to_string(),
            data_dir: dir.path().to_path_buf(),
            communities: vec![CommunityConfig {
                name: "home".to_string(),
                api: "http://127.0.0.1:1".to_string(),
                failover_api: None,
                private_key: None,
            }],
            heartbeat_interval_secs: 300,
            failover_threshold: 3,
            startup_failover_threshold: 3,
            retry_queue_max: 100,
            delivery_timeout_secs: 1,
            relay_timeout_secs: 1,
            cache_stale_secs: 300,
        };
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(CommunityManager::new(config, tx.clone()).unwrap());
        let queue = Arc::new(RetryQueue::new(100, tx.clone()));
        let pipeline =
            Arc::new(MessagePipeline::new(Arc::clone(&manager), queue, tx).unwrap());
        Harness {
            pipeline,
            events: rx,
            manager,
            _dir: dir,
        }
    }

    fn seed_contact(harness: &Harness, name: &str, key: &AgentKeypair) {
        let community = harness.manager.default_community();
        let contact = CachedContact {
            username: name.to_string(),
            public_key: key.public_key().to_spki_base64(),
            endpoint: Some(format!("https://{name}.example.org/inbox")),
            added_at: "2026-01-01T00:00:00Z".to_string(),
            online: true,
            last_seen: None,
            key_updated_at: None,
            recovery_in_progress: false,
            community: "home".to_string(),
        };
        community.cache.write().replace_all(vec![contact]);
    }

    /// Replicate the sender side: seal and sign an envelope from `sender`.
    fn sealed_envelope(
        sender: &AgentKeypair,
        sender_name: &str,
        recipient: &AgentKeypair,
        recipient_name: &str,
        payload: &Value,
    ) -> Envelope {
        let pair_key = derive_pair_key(
            sender,
            sender_name,
            &recipient.public_key(),
            recipient_name,
        )
        .unwrap();
        let message_id = uuid::Uuid::new_v4().to_string();
        let sealed = PairwiseCrypto::new(&pair_key)
            .seal(&serde_json::to_vec(payload).unwrap(), message_id.as_bytes())
            .unwrap();
        let mut envelope = Envelope::with_message_id(
            EnvelopeKind::Direct,
            message_id,
            sender_name,
            recipient_name,
            EnvelopePayload::from_sealed(&sealed),
        );
        envelope.sign(sender).unwrap();
        envelope
    }

    fn next_event(rx: &mut broadcast::Receiver<MeshEvent>) -> Option<MeshEvent> {
        rx.try_recv().ok()
    }

    #[tokio::test]
    async fn test_receive_direct_emits_verified_message() {
        let alice = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let mut h = harness(&bob);
        seed_contact(&h, "alice", &alice);

        let envelope = sealed_envelope(&alice, "alice", &bob, "bob", &json!({"text": "hi"}));
        h.pipeline.receive_envelope(envelope.clone()).await.unwrap();

        match next_event(&mut h.events) {
            Some(MeshEvent::Message {
                sender,
                payload,
                verified,
                message_id,
                ..
            }) => {
                assert_eq!(sender, "alice");
                assert_eq!(payload, json!({"text": "hi"}));
                assert!(verified);
                assert_eq!(message_id, envelope.message_id);
            }
            other => panic!("expected Message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_direct_message_silently_dropped() {
        let alice = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let mut h = harness(&bob);
        seed_contact(&h, "alice", &alice);

        let envelope = sealed_envelope(&alice, "alice", &bob, "bob", &json!({"n": 1}));
        h.pipeline.receive_envelope(envelope.clone()).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events),
            Some(MeshEvent::Message { .. })
        ));

        // Second delivery of the same envelope: Ok, but no event
        h.pipeline.receive_envelope(envelope).await.unwrap();
        assert!(next_event(&mut h.events).is_none());
    }

    #[tokio::test]
    async fn test_receive_rejects_tampered_envelope() {
        let alice = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let h = harness(&bob);
        seed_contact(&h, "alice", &alice);

        let mut envelope = sealed_envelope(&alice, "alice", &bob, "bob", &json!({"n": 1}));
        // Timestamp changed after signing: signature no longer verifies
        envelope.timestamp = (Utc::now() + chrono::Duration::seconds(90))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let result = h.pipeline.receive_envelope(envelope).await;
        assert!(matches!(result, Err(MeshError::SignatureInvalid(_))));
    }

    #[tokio::test]
    async fn test_receive_rejects_unknown_sender() {
        let mallory = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let h = harness(&bob);
        // No contacts seeded, relay unreachable: the key cannot resolve

        let envelope = sealed_envelope(&mallory, "mallory", &bob, "bob", &json!({"n": 1}));
        let result = h.pipeline.receive_envelope(envelope).await;
        assert!(matches!(result, Err(MeshError::Auth(_))));
    }

    #[tokio::test]
    async fn test_receive_rejects_wrong_recipient() {
        let alice = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let carol = AgentKeypair::generate();
        let h = harness(&bob);
        seed_contact(&h, "alice", &alice);

        let envelope = sealed_envelope(&alice, "alice", &carol, "carol", &json!({"n": 1}));
        let result = h.pipeline.receive_envelope(envelope).await;
        assert!(matches!(result, Err(MeshError::Validation(_))));
    }

    #[tokio::test]
    async fn test_contact_request_emits_event_without_contact() {
        let carol = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let mut h = harness(&bob);

        let mut envelope = Envelope::new(
            EnvelopeKind::ContactRequest,
            "carol",
            "bob",
            EnvelopePayload::Plain(json!({
                "greeting": "Hi Bob!",
                "publicKey": carol.public_key().to_spki_base64(),
            })),
        );
        envelope.sign(&carol).unwrap();

        h.pipeline.receive_envelope(envelope).await.unwrap();
        match next_event(&mut h.events) {
            Some(MeshEvent::ContactRequest { from, greeting, .. }) => {
                assert_eq!(from, "carol");
                assert_eq!(greeting.as_deref(), Some("Hi Bob!"));
            }
            other => panic!("expected ContactRequest event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_record_requires_admin_signature() {
        let admin = AgentKeypair::generate();
        let rogue = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let mut h = harness(&bob);
        let community = h.manager.default_community();
        community.set_admin_keys(vec![admin.public_key()]);

        let payload = r#"{"notice":"maintenance tonight"}"#;
        let record = BroadcastRecord {
            id: "b-1".to_string(),
            broadcast_type: BroadcastKind::Maintenance,
            payload: payload.to_string(),
            sender: "admin".to_string(),
            signature: rogue.sign_base64(payload.as_bytes()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(h
            .pipeline
            .handle_broadcast_record(&community, record)
            .is_err());

        let record = BroadcastRecord {
            id: "b-1".to_string(),
            broadcast_type: BroadcastKind::Maintenance,
            payload: payload.to_string(),
            sender: "admin".to_string(),
            signature: admin.sign_base64(payload.as_bytes()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(h
            .pipeline
            .handle_broadcast_record(&community, record.clone())
            .unwrap());
        assert!(matches!(
            next_event(&mut h.events),
            Some(MeshEvent::Broadcast { .. })
        ));

        // Same id again: deduplicated
        assert!(!h
            .pipeline
            .handle_broadcast_record(&community, record)
            .unwrap());
    }

    #[tokio::test]
    async fn test_revocation_broadcast_blocks_sender() {
        let admin = AgentKeypair::generate();
        let alice = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let mut h = harness(&bob);
        seed_contact(&h, "alice", &alice);
        let community = h.manager.default_community();
        community.set_admin_keys(vec![admin.public_key()]);

        let payload = r#"{"revokedAgent":"alice","revokedAt":"2026-01-01T00:00:00Z"}"#;
        let record = BroadcastRecord {
            id: "rev-1".to_string(),
            broadcast_type: BroadcastKind::Revocation,
            payload: payload.to_string(),
            sender: "admin".to_string(),
            signature: admin.sign_base64(payload.as_bytes()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        h.pipeline.handle_broadcast_record(&community, record).unwrap();
        assert!(h.pipeline.is_revoked("alice"));
        let _ = next_event(&mut h.events);

        // Messages from a revoked sender are now invalid
        let envelope = sealed_envelope(&alice, "alice", &bob, "bob", &json!({"n": 1}));
        let result = h.pipeline.receive_envelope(envelope).await;
        assert!(matches!(result, Err(MeshError::Auth(_))));
    }
}
