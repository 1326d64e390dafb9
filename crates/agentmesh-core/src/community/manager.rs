//! The community manager
//!
//! Multiplexes all relay operations over N communities. Owns the heartbeat
//! timers, the per-community contact caches, and the failover accounting;
//! the message pipeline borrows this manager and never the other way
//! around.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CommunityConfig, MeshConfig};
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::identity::{AgentKeypair, AgentPublicKey};
use crate::relay::{ApiError, PresenceInfo, RelayClient};
use crate::types::RecipientName;

use super::cache::{CachedContact, ContactCache};
use super::failover::{FailoverState, RelayRole};

/// Per-community rotation result, reported to the caller on partial failure.
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub community: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Everything the runtime holds for one community.
pub struct Community {
    name: String,
    keypair: Arc<AgentKeypair>,
    primary: RelayClient,
    failover: Option<RelayClient>,
    primary_host: Option<String>,
    failover_host: Option<String>,
    state: Mutex<FailoverState>,
    pub(crate) cache: RwLock<ContactCache>,
    admin_keys: RwLock<Vec<AgentPublicKey>>,
}

impl Community {
    fn build(config: &CommunityConfig, mesh: &MeshConfig, top_key: &Arc<AgentKeypair>) -> MeshResult<Self> {
        let keypair = match &config.private_key {
            Some(encoded) => Arc::new(AgentKeypair::from_pkcs8_base64(encoded)?),
            None => Arc::clone(top_key),
        };

        let timeout = Duration::from_secs(mesh.relay_timeout_secs);
        let primary = RelayClient::new(&config.api, &mesh.username, Arc::clone(&keypair), timeout)?;
        let failover = config
            .failover_api
            .as_ref()
            .map(|api| RelayClient::new(api, &mesh.username, Arc::clone(&keypair), timeout))
            .transpose()?;

        Ok(Self {
            name: config.name.clone(),
            keypair,
            primary,
            failover,
            primary_host: host_of(&config.api),
            failover_host: config.failover_api.as_deref().and_then(host_of),
            state: Mutex::new(FailoverState::new()),
            cache: RwLock::new(ContactCache::load(&mesh.data_dir, &config.name)),
            admin_keys: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keypair(&self) -> &Arc<AgentKeypair> {
        &self.keypair
    }

    /// Which relay the community currently talks to.
    pub fn active_relay(&self) -> RelayRole {
        self.state.lock().active
    }

    fn active_client(&self) -> &RelayClient {
        match self.state.lock().active {
            RelayRole::Primary => &self.primary,
            RelayRole::Failover => self.failover.as_ref().unwrap_or(&self.primary),
        }
    }

    /// Whether a qualified name's hostname addresses this community.
    pub fn matches_host(&self, host: &str) -> bool {
        self.primary_host.as_deref() == Some(host) || self.failover_host.as_deref() == Some(host)
    }

    /// Snapshot of a cached contact.
    pub fn cached_contact(&self, username: &str) -> Option<CachedContact> {
        self.cache.read().get(username).cloned()
    }

    /// Admin public keys cached from the relay, refreshed on heartbeat.
    pub fn admin_public_keys(&self) -> Vec<AgentPublicKey> {
        self.admin_keys.read().clone()
    }

    pub(crate) fn set_admin_keys(&self, keys: Vec<AgentPublicKey>) {
        *self.admin_keys.write() = keys;
    }
}

impl std::fmt::Debug for Community {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Community")
            .field("name", &self.name)
            .field("active", &self.active_relay())
            .finish_non_exhaustive()
    }
}

fn host_of(api: &str) -> Option<String> {
    reqwest::Url::parse(api)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Coordinates relay traffic, presence, caches, and key rotation across all
/// configured communities.
pub struct CommunityManager {
    config: MeshConfig,
    communities: Vec<Arc<Community>>,
    events: broadcast::Sender<MeshEvent>,
    heartbeat_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommunityManager {
    /// Build the manager: parse keys, construct relay clients, load caches.
    ///
    /// # Errors
    ///
    /// Returns `Config`/`Validation` for a bad configuration or unparseable
    /// private key.
    pub fn new(config: MeshConfig, events: broadcast::Sender<MeshEvent>) -> MeshResult<Self> {
        config.validate()?;
        let top_key = Arc::new(AgentKeypair::from_pkcs8_base64(&config.private_key)?);

        let communities = config
            .communities
            .iter()
            .map(|c| Community::build(c, &config, &top_key).map(Arc::new))
            .collect::<MeshResult<Vec<_>>>()?;

        info!(count = communities.len(), "Community manager initialized");

        Ok(Self {
            config,
            communities,
            events,
            heartbeat_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn communities(&self) -> &[Arc<Community>] {
        &self.communities
    }

    pub fn get(&self, name: &str) -> Option<Arc<Community>> {
        self.communities.iter().find(|c| c.name == name).cloned()
    }

    /// The default community: the first one configured.
    pub fn default_community(&self) -> Arc<Community> {
        self.communities[0].clone()
    }

    /// Route one relay call through a community's active relay, feeding the
    /// failover accounting with the outcome.
    pub async fn call_api<T, F, Fut>(&self, community: &Community, op: F) -> MeshResult<T>
    where
        F: FnOnce(RelayClient) -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        let client = community.active_client().clone();
        match op(client).await {
            Ok(value) => {
                community.state.lock().record_success();
                Ok(value)
            }
            Err(err) => {
                if err.is_transient() {
                    let flipped = community.state.lock().record_failure(
                        community.failover.is_some(),
                        self.config.failover_threshold,
                        self.config.startup_failover_threshold,
                    );
                    if flipped {
                        warn!(
                            community = %community.name,
                            "Primary relay unreachable, switching to failover"
                        );
                        let _ = self.events.send(MeshEvent::CommunityFailover {
                            community: community.name.clone(),
                        });
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Start heartbeat timers: one immediate heartbeat per community, then
    /// one every `heartbeat_interval`. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.heartbeat_tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for community in self.communities.clone() {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    manager.config.heartbeat_interval_secs,
                ));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    manager.heartbeat_once(&community).await;
                }
            }));
        }
        info!("Heartbeat timers started");
    }

    /// Cancel heartbeat timers and flush caches. Idempotent.
    pub fn stop(&self) {
        for task in self.heartbeat_tasks.lock().drain(..) {
            task.abort();
        }
        for community in &self.communities {
            if let Err(e) = community.cache.read().save() {
                warn!(community = %community.name, error = %e, "Failed to flush contact cache");
            }
        }
        info!("Community manager stopped");
    }

    /// One heartbeat: advertise our endpoint, then refresh the cached admin
    /// keys. A miss is a normal failure and flows through `call_api`.
    pub async fn heartbeat_once(&self, community: &Arc<Community>) {
        let endpoint = self.config.endpoint.clone();
        match self
            .call_api(community, |client| async move {
                client.heartbeat(&endpoint).await
            })
            .await
        {
            Ok(_) => {
                debug!(community = %community.name, "Heartbeat ok");
                self.refresh_admin_keys(community).await;
            }
            Err(e) => {
                debug!(community = %community.name, error = %e, "Heartbeat failed");
            }
        }
    }

    async fn refresh_admin_keys(&self, community: &Arc<Community>) {
        match self
            .call_api(community, |client| async move { client.admin_keys().await })
            .await
        {
            Ok(keys) => {
                let parsed: Vec<AgentPublicKey> = keys
                    .iter()
                    .filter_map(|k| AgentPublicKey::from_spki_base64(&k.public_key).ok())
                    .collect();
                community.set_admin_keys(parsed);
            }
            Err(e) => {
                debug!(community = %community.name, error = %e, "Admin key refresh failed");
            }
        }
    }

    /// Refresh one community's contact cache from its relay. The whole map
    /// is replaced atomically; peers whose published key changed produce
    /// `KeyChanged` events.
    pub async fn refresh_contacts(&self, community: &Arc<Community>) -> MeshResult<()> {
        let contacts = self
            .call_api(community, |client| async move {
                client.list_contacts().await
            })
            .await?;

        let cached: Vec<CachedContact> = contacts
            .into_iter()
            .map(|c| CachedContact::from_contact_info(c, &community.name))
            .collect();

        let changes = {
            let mut cache = community.cache.write();
            let changes = cache.replace_all(cached);
            if let Err(e) = cache.save() {
                warn!(community = %community.name, error = %e, "Failed to persist contact cache");
            }
            changes
        };

        for change in changes {
            warn!(
                community = %community.name,
                username = %change.username,
                "Cached peer key changed"
            );
            let _ = self.events.send(MeshEvent::KeyChanged {
                community: community.name.clone(),
                username: change.username,
                previous_key: change.previous_key,
                new_key: change.new_key,
            });
        }

        Ok(())
    }

    /// Look up a contact for sending. A stale or missing entry triggers a
    /// relay refresh; a refresh failure keeps whatever was cached.
    pub async fn contact_for_send(
        &self,
        community: &Arc<Community>,
        username: &str,
    ) -> Option<CachedContact> {
        let stale_after = Duration::from_secs(self.config.cache_stale_secs);
        let (hit, stale) = {
            let cache = community.cache.read();
            (cache.get(username).cloned(), cache.is_stale(stale_after))
        };

        if hit.is_some() && !stale {
            return hit;
        }

        if let Err(e) = self.refresh_contacts(community).await {
            debug!(
                community = %community.name,
                error = %e,
                "Contact refresh failed, keeping cached entry"
            );
        }
        community.cache.read().get(username).cloned().or(hit)
    }

    /// Resolve a peer's public key for signature verification: cache first,
    /// one refresh from the peer's community if missing.
    pub async fn sender_public_key(
        &self,
        community: &Arc<Community>,
        username: &str,
    ) -> Option<String> {
        if let Some(contact) = community.cache.read().get(username) {
            return Some(contact.public_key.clone());
        }
        let _ = self.refresh_contacts(community).await;
        community
            .cache
            .read()
            .get(username)
            .map(|c| c.public_key.clone())
    }

    /// Resolve a possibly-qualified recipient name to its community.
    ///
    /// Qualified names match on relay hostname. Unqualified names resolve to
    /// the first community holding the peer in its cache, falling back to
    /// the default community.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCommunity` when a qualified hostname matches no
    /// configured relay.
    pub fn resolve(&self, name: &RecipientName) -> MeshResult<(Arc<Community>, String)> {
        if let Some(host) = &name.hostname {
            return self
                .communities
                .iter()
                .find(|c| c.matches_host(host))
                .map(|c| (c.clone(), name.username.clone()))
                .ok_or_else(|| MeshError::UnknownCommunity(host.clone()));
        }

        for community in &self.communities {
            if community.cache.read().contains(&name.username) {
                return Ok((community.clone(), name.username.clone()));
            }
        }
        Ok((self.default_community(), name.username.clone()))
    }

    /// First community that knows this peer, used to attribute inbound
    /// envelopes to a community.
    pub fn community_of_peer(&self, username: &str) -> Option<Arc<Community>> {
        self.communities
            .iter()
            .find(|c| c.cache.read().contains(username))
            .cloned()
    }

    /// Fresh presence check against the relay, used by retry attempts.
    pub async fn check_presence(
        &self,
        community: &Arc<Community>,
        agent: &str,
    ) -> MeshResult<PresenceInfo> {
        let agent = agent.to_string();
        self.call_api(community, |client| async move {
            client.get_presence(&agent).await
        })
        .await
    }

    /// Fan a key rotation out to every relay holding one of the keys being
    /// rotated.
    ///
    /// Communities are grouped by the private key they use; the rotate call
    /// goes to each community in the affected groups, signed with that
    /// group's current key. Partial failure is reported per community and
    /// emits `KeyRotationPartial`; total failure is an error.
    pub async fn rotate_key(
        &self,
        new_public_key: &str,
        filter: Option<&[String]>,
    ) -> MeshResult<Vec<RotationOutcome>> {
        AgentPublicKey::from_spki_base64(new_public_key)?;

        let targets: Vec<Arc<Community>> = match filter {
            Some(names) => names
                .iter()
                .map(|n| {
                    self.get(n)
                        .ok_or_else(|| MeshError::UnknownCommunity(n.clone()))
                })
                .collect::<MeshResult<Vec<_>>>()?,
            None => self.communities.clone(),
        };

        // Keys being rotated, then every community using one of them.
        let rotating: HashSet<[u8; 32]> = targets
            .iter()
            .map(|c| *c.keypair.public_key().as_bytes())
            .collect();
        let group: Vec<Arc<Community>> = self
            .communities
            .iter()
            .filter(|c| rotating.contains(c.keypair.public_key().as_bytes()))
            .cloned()
            .collect();

        let mut outcomes = Vec::with_capacity(group.len());
        for community in &group {
            let key = new_public_key.to_string();
            let result = self
                .call_api(community, |client| async move {
                    client.rotate_key(&key).await
                })
                .await;
            outcomes.push(match result {
                Ok(_) => RotationOutcome {
                    community: community.name.clone(),
                    ok: true,
                    error: None,
                },
                Err(e) => RotationOutcome {
                    community: community.name.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                },
            });
        }

        let rotated: Vec<String> = outcomes
            .iter()
            .filter(|o| o.ok)
            .map(|o| o.community.clone())
            .collect();
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.ok)
            .map(|o| o.community.clone())
            .collect();

        if rotated.is_empty() {
            return Err(MeshError::Transport(
                "key rotation failed on every relay".to_string(),
            ));
        }
        if !failed.is_empty() {
            warn!(?rotated, ?failed, "Key rotation partially failed");
            let _ = self.events.send(MeshEvent::KeyRotationPartial { rotated, failed });
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommunityConfig;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, communities: Vec<CommunityConfig>) -> MeshConfig {
        MeshConfig {
            username: "alice".to_string(),
            private_key: AgentKeypair::generate().to_pkcs8_base64(),
            endpoint: "https://alice.example.org/inbox".to_string(),
            data_dir: dir.path().to_path_buf(),
            communities,
            heartbeat_interval_secs: 300,
            failover_threshold: 3,
            startup_failover_threshold: 1,
            retry_queue_max: 100,
            delivery_timeout_secs: 5,
            relay_timeout_secs: 1,
            cache_stale_secs: 300,
        }
    }

    fn community_config(name: &str, api: &str) -> CommunityConfig {
        CommunityConfig {
            name: name.to_string(),
            api: api.to_string(),
            failover_api: None,
            private_key: None,
        }
    }

    fn seed_cache(community: &Community, usernames: &[&str]) {
        let contacts = usernames
            .iter()
            .map(|u| CachedContact {
                username: u.to_string(),
                public_key: "key".to_string(),
                endpoint: None,
                added_at: "2026-01-01T00:00:00Z".to_string(),
                online: false,
                last_seen: None,
                key_updated_at: None,
                recovery_in_progress: false,
                community: community.name().to_string(),
            })
            .collect();
        community.cache.write().replace_all(contacts);
    }

    fn manager(dir: &TempDir, communities: Vec<CommunityConfig>) -> Arc<CommunityManager> {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(CommunityManager::new(test_config(dir, communities), tx).unwrap())
    }

    #[tokio::test]
    async fn test_resolve_qualified_name() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(
            &dir,
            vec![
                community_config("home", "https://relay.home.org"),
                community_config("work", "https://relay.work.org"),
            ],
        );

        let name = RecipientName::parse("bob@relay.work.org").unwrap();
        let (community, username) = mgr.resolve(&name).unwrap();
        assert_eq!(community.name(), "work");
        assert_eq!(username, "bob");
    }

    #[tokio::test]
    async fn test_resolve_unknown_hostname() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, vec![community_config("home", "https://relay.home.org")]);
        let name = RecipientName::parse("bob@nowhere.org").unwrap();
        assert!(matches!(
            mgr.resolve(&name),
            Err(MeshError::UnknownCommunity(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_unqualified_prefers_cache_hit() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(
            &dir,
            vec![
                community_config("home", "https://relay.home.org"),
                community_config("work", "https://relay.work.org"),
            ],
        );
        seed_cache(&mgr.communities()[1], &["bob"]);

        let name = RecipientName::parse("bob").unwrap();
        let (community, _) = mgr.resolve(&name).unwrap();
        assert_eq!(community.name(), "work");
    }

    #[tokio::test]
    async fn test_resolve_unqualified_falls_to_default() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(
            &dir,
            vec![
                community_config("home", "https://relay.home.org"),
                community_config("work", "https://relay.work.org"),
            ],
        );

        let name = RecipientName::parse("stranger").unwrap();
        let (community, _) = mgr.resolve(&name).unwrap();
        assert_eq!(community.name(), "home");
    }

    #[tokio::test]
    async fn test_failover_event_emitted_once() {
        let dir = TempDir::new().unwrap();
        // Nothing listens on these ports: every call is a network failure.
        let mut config = community_config("home", "http://127.0.0.1:1");
        config.failover_api = Some("http://127.0.0.1:2".to_string());
        let (tx, mut rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mgr = Arc::new(
            CommunityManager::new(test_config(&dir, vec![config]), tx).unwrap(),
        );
        let community = mgr.default_community();

        // Startup threshold is 1: the first failure flips to failover.
        let result = mgr
            .call_api(&community, |client| async move {
                client.list_contacts().await
            })
            .await;
        assert!(result.is_err());
        assert_eq!(community.active_relay(), RelayRole::Failover);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            MeshEvent::CommunityFailover { ref community } if community == "home"
        ));

        // Sticky: more failures on the failover relay emit nothing further.
        let _ = mgr
            .call_api(&community, |client| async move {
                client.list_contacts().await
            })
            .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(community.active_relay(), RelayRole::Failover);
    }

    #[tokio::test]
    async fn test_rotate_key_rejects_bad_key() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, vec![community_config("home", "https://relay.home.org")]);
        assert!(mgr.rotate_key("garbage", None).await.is_err());
    }

    #[tokio::test]
    async fn test_rotate_key_unknown_filter_community() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, vec![community_config("home", "https://relay.home.org")]);
        let new_key = AgentKeypair::generate().public_key().to_spki_base64();
        let filter = vec!["nowhere".to_string()];
        assert!(matches!(
            mgr.rotate_key(&new_key, Some(&filter)).await,
            Err(MeshError::UnknownCommunity(_))
        ));
    }
}
