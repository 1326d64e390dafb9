//! MeshEngine - the primary entry point for the agentmesh client runtime
//!
//! The engine wires configuration → community manager → message pipeline and
//! owns the background tasks (heartbeats, retry scanner, broadcast poller).
//! The host application constructs one engine, subscribes to events, and
//! routes its HTTPS inbox into [`MeshEngine::receive_envelope`].
//!
//! # Example
//!
//! ```ignore
//! use agentmesh_core::{MeshConfig, MeshEngine};
//!
//! let engine = MeshEngine::new(config)?;
//! let mut events = engine.subscribe();
//! engine.start();
//!
//! engine.send_message("bob", &serde_json::json!({"text": "hi"})).await;
//!
//! while let Ok(event) = events.recv().await {
//!     // match on MeshEvent variants
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::community::{Community, CommunityManager, RotationOutcome};
use crate::config::MeshConfig;
use crate::envelope::Envelope;
use crate::error::{MeshError, MeshResult};
use crate::events::{MeshEvent, EVENT_CHANNEL_CAPACITY};
use crate::pipeline::{DeliveryReport, MessagePipeline};
use crate::queue::RetryQueue;
use crate::relay::{
    ContactInfo, ContactRequestBody, CreateGroupRequest, GroupInfo, GroupInviteRequest,
    PendingContactInfo, RecoverKeyRequest, GroupSettings,
};
use crate::types::{GroupSendReport, RecipientName, SendOutcome};

/// Maximum greeting length on contact requests
pub const GREETING_MAX_LEN: usize = 500;

/// The client runtime facade.
pub struct MeshEngine {
    manager: Arc<CommunityManager>,
    pipeline: Arc<MessagePipeline>,
    queue: Arc<RetryQueue>,
    events: broadcast::Sender<MeshEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MeshEngine {
    /// Build the engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config`/`Validation` for a bad configuration or key.
    pub fn new(config: MeshConfig) -> MeshResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(CommunityManager::new(config, events.clone())?);
        let queue = Arc::new(RetryQueue::new(
            manager.config().retry_queue_max,
            events.clone(),
        ));
        let pipeline = Arc::new(MessagePipeline::new(
            Arc::clone(&manager),
            Arc::clone(&queue),
            events.clone(),
        )?);

        Ok(Self {
            manager,
            pipeline,
            queue,
            events,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// The community manager (cache inspection, presence checks).
    pub fn manager(&self) -> &Arc<CommunityManager> {
        &self.manager
    }

    /// How many messages currently wait in the retry queue.
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Start background work: heartbeats, the retry scanner, and the
    /// broadcast poller. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting mesh engine");

        self.manager.start();

        let mut tasks = self.tasks.lock();
        tasks.push(self.pipeline.spawn_retry_scanner());
        tasks.push(self.spawn_broadcast_poller());
    }

    /// Poll each community's broadcast feed on the heartbeat cadence and
    /// run new records through the receive pipeline's verification.
    fn spawn_broadcast_poller(&self) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let pipeline = Arc::clone(&self.pipeline);
        let interval = Duration::from_secs(manager.config().heartbeat_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for community in manager.communities() {
                    let records = match manager
                        .call_api(community, |client| async move {
                            client.broadcasts().await
                        })
                        .await
                    {
                        Ok(records) => records,
                        Err(e) => {
                            debug!(community = %community.name(), error = %e, "Broadcast poll failed");
                            continue;
                        }
                    };
                    for record in records {
                        if let Err(e) = pipeline.handle_broadcast_record(community, record) {
                            debug!(community = %community.name(), error = %e, "Broadcast rejected");
                        }
                    }
                }
            }
        })
    }

    /// Stop background work, let in-flight deliveries finish or time out,
    /// and flush caches. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping mesh engine");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.manager.stop();
    }

    // -- Messaging ---------------------------------------------------------

    /// Send a direct message. See [`MessagePipeline::send_message`].
    pub async fn send_message(&self, recipient: &str, payload: &Value) -> SendOutcome {
        self.pipeline.send_message(recipient, payload).await
    }

    /// Fan a message out to a group.
    pub async fn send_to_group(&self, group_id: &str, payload: &Value) -> MeshResult<GroupSendReport> {
        self.pipeline.send_to_group(group_id, payload).await
    }

    /// Feed one inbound envelope from the HTTPS inbox into the pipeline.
    pub async fn receive_envelope(&self, envelope: Envelope) -> MeshResult<()> {
        self.pipeline.receive_envelope(envelope).await
    }

    /// Delivery reports recorded for a message id.
    pub fn delivery_reports(&self, message_id: &str) -> Vec<DeliveryReport> {
        self.pipeline.delivery_reports(message_id)
    }

    // -- Contact workflow --------------------------------------------------

    /// Ask the relay to record a contact request to `to` (possibly
    /// qualified).
    pub async fn request_contact(&self, to: &str, greeting: Option<&str>) -> MeshResult<()> {
        if let Some(greeting) = greeting {
            if greeting.len() > GREETING_MAX_LEN {
                return Err(MeshError::Validation(format!(
                    "greeting exceeds {GREETING_MAX_LEN} characters"
                )));
            }
        }
        let name = RecipientName::parse(to)?;
        let (community, username) = self.manager.resolve(&name)?;
        let body = ContactRequestBody {
            to: username,
            greeting: greeting.map(str::to_string),
        };
        self.manager
            .call_api(&community, |client| async move {
                client.request_contact(&body).await
            })
            .await?;
        Ok(())
    }

    /// Pending contact requests addressed to us in one community.
    pub async fn pending_contacts(&self, community: &str) -> MeshResult<Vec<PendingContactInfo>> {
        let community = self.community(community)?;
        self.manager
            .call_api(&community, |client| async move {
                client.pending_contacts().await
            })
            .await
    }

    /// Accept a pending request from `agent`; refreshes the contact cache.
    pub async fn accept_contact(&self, community: &str, agent: &str) -> MeshResult<()> {
        let community = self.community(community)?;
        let agent = agent.to_string();
        self.manager
            .call_api(&community, |client| async move {
                client.accept_contact(&agent).await
            })
            .await?;
        if let Err(e) = self.manager.refresh_contacts(&community).await {
            debug!(community = %community.name(), error = %e, "Contact refresh after accept failed");
        }
        Ok(())
    }

    /// Deny a pending request from `agent`. The requester may ask again.
    pub async fn deny_contact(&self, community: &str, agent: &str) -> MeshResult<()> {
        let community = self.community(community)?;
        let agent = agent.to_string();
        self.manager
            .call_api(&community, |client| async move {
                client.deny_contact(&agent).await
            })
            .await?;
        Ok(())
    }

    /// Remove an accepted contact.
    pub async fn remove_contact(&self, community: &str, agent: &str) -> MeshResult<()> {
        let community = self.community(community)?;
        let agent = agent.to_string();
        self.manager
            .call_api(&community, |client| async move {
                client.remove_contact(&agent).await
            })
            .await?;
        if let Err(e) = self.manager.refresh_contacts(&community).await {
            debug!(community = %community.name(), error = %e, "Contact refresh after removal failed");
        }
        Ok(())
    }

    /// Current accepted contacts in one community, straight from the relay.
    pub async fn list_contacts(&self, community: &str) -> MeshResult<Vec<ContactInfo>> {
        let community = self.community(community)?;
        let contacts = self
            .manager
            .call_api(&community, |client| async move {
                client.list_contacts().await
            })
            .await?;
        Ok(contacts)
    }

    // -- Groups ------------------------------------------------------------

    /// Create a group on one community's relay; the caller becomes owner.
    pub async fn create_group(
        &self,
        community: &str,
        name: &str,
        settings: Option<GroupSettings>,
    ) -> MeshResult<GroupInfo> {
        let community = self.community(community)?;
        let body = CreateGroupRequest {
            name: name.to_string(),
            settings,
        };
        self.manager
            .call_api(&community, |client| async move {
                client.create_group(&body).await
            })
            .await
    }

    /// Invite an agent into a group.
    pub async fn invite_to_group(
        &self,
        community: &str,
        group_id: &str,
        invitee: &str,
        greeting: Option<&str>,
    ) -> MeshResult<()> {
        let community = self.community(community)?;
        let group_id = group_id.to_string();
        let body = GroupInviteRequest {
            invitee: invitee.to_string(),
            greeting: greeting.map(str::to_string),
        };
        self.manager
            .call_api(&community, |client| async move {
                client.invite_to_group(&group_id, &body).await
            })
            .await?;
        Ok(())
    }

    /// Accept a group invitation addressed to us.
    pub async fn accept_group_invitation(
        &self,
        community: &str,
        group_id: &str,
    ) -> MeshResult<()> {
        let community = self.community(community)?;
        let group_id = group_id.to_string();
        self.manager
            .call_api(&community, |client| async move {
                client.accept_group_invitation(&group_id).await
            })
            .await?;
        Ok(())
    }

    // -- Keys --------------------------------------------------------------

    /// Rotate to a new public key across the relays using the current key.
    pub async fn rotate_key(
        &self,
        new_public_key: &str,
        communities: Option<&[String]>,
    ) -> MeshResult<Vec<RotationOutcome>> {
        self.manager.rotate_key(new_public_key, communities).await
    }

    /// Begin email-verified key recovery in one community. Does not depend
    /// on the lost key; the relay applies the new key after its cooling-off
    /// window.
    pub async fn recover_key(
        &self,
        community: &str,
        email: &str,
        new_public_key: &str,
    ) -> MeshResult<()> {
        let community = self.community(community)?;
        let body = RecoverKeyRequest {
            email: email.to_string(),
            new_public_key: new_public_key.to_string(),
        };
        self.manager
            .call_api(&community, |client| async move {
                client.recover_key(&body).await
            })
            .await?;
        Ok(())
    }

    fn community(&self, name: &str) -> MeshResult<Arc<Community>> {
        self.manager
            .get(name)
            .ok_or_else(|| MeshError::UnknownCommunity(name.to_string()))
    }
}

impl Drop for MeshEngine {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
