//! Group fan-out
//!
//! A group send fetches the member list (60-second local cache, refreshed
//! from the relay on miss), allocates one message id for the batch, and
//! builds an individually encrypted envelope per member: identical
//! plaintext, pairwise ECDH per recipient. Delivery runs with bounded
//! concurrency; offline members enqueue under the shared message id.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::community::{CachedContact, Community};
use crate::envelope::EnvelopeKind;
use crate::error::MeshResult;
use crate::events::DeliveryState;
use crate::relay::GroupMemberInfo;
use crate::types::{GroupSendReport, RecipientName};

use super::delivery::{post_envelope, DeliveryResult};
use super::MessagePipeline;

/// Member-list cache TTL
pub const GROUP_MEMBER_CACHE_TTL_SECS: u64 = 60;

/// Maximum concurrent per-member deliveries
pub const GROUP_FANOUT_CONCURRENCY: usize = 10;

/// TTL cache of group member lists.
#[derive(Debug, Default)]
pub struct GroupMemberCache {
    entries: HashMap<String, (Instant, Vec<GroupMemberInfo>)>,
}

impl GroupMemberCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, group_id: &str) -> Option<&Vec<GroupMemberInfo>> {
        self.entries.get(group_id).and_then(|(at, members)| {
            if at.elapsed().as_secs() < GROUP_MEMBER_CACHE_TTL_SECS {
                Some(members)
            } else {
                None
            }
        })
    }

    fn put(&mut self, group_id: &str, members: Vec<GroupMemberInfo>) {
        self.entries
            .insert(group_id.to_string(), (Instant::now(), members));
    }

    fn invalidate(&mut self, group_id: &str) {
        self.entries.remove(group_id);
    }
}

/// Per-member delivery verdict, collected into the batch report.
enum MemberOutcome {
    Delivered(String),
    Queued(String),
    Failed(String),
}

impl MessagePipeline {
    /// Fetch a group's member list through the TTL cache.
    async fn group_members(
        &self,
        community: &Arc<Community>,
        group_id: &str,
    ) -> MeshResult<Vec<GroupMemberInfo>> {
        if let Some(members) = self.member_cache.lock().get(group_id) {
            return Ok(members.clone());
        }

        let id = group_id.to_string();
        let members = self
            .manager
            .call_api(community, |client| async move {
                client.group_members(&id).await
            })
            .await?;

        self.member_cache.lock().put(group_id, members.clone());
        Ok(members)
    }

    /// Membership check for inbound group messages: cache first, one relay
    /// refresh if the sender is absent.
    pub(crate) async fn confirm_group_member(
        &self,
        community: &Arc<Community>,
        group_id: &str,
        agent: &str,
    ) -> bool {
        match self.group_members(community, group_id).await {
            Ok(members) if members.iter().any(|m| m.agent == agent) => true,
            Ok(_) => {
                // Absent from the cached list; force one refresh before rejecting
                self.member_cache.lock().invalidate(group_id);
                match self.group_members(community, group_id).await {
                    Ok(members) => members.iter().any(|m| m.agent == agent),
                    Err(_) => false,
                }
            }
            Err(e) => {
                debug!(group_id, error = %e, "Member list unavailable");
                false
            }
        }
    }

    /// Send a payload to every member of a group.
    ///
    /// # Errors
    ///
    /// Returns an error only when the member list cannot be resolved at all;
    /// per-member failures land in the report buckets.
    pub async fn send_to_group(
        self: &Arc<Self>,
        group_id: &str,
        payload: &Value,
    ) -> MeshResult<GroupSendReport> {
        // Groups live on one relay; a qualified id pins the community the
        // same way recipient names do.
        let (community, group_id) = match group_id.split_once('@') {
            Some((id, host)) => {
                let name = RecipientName {
                    username: id.to_string(),
                    hostname: Some(host.to_string()),
                };
                let (community, _) = self.manager.resolve(&name)?;
                (community, id.to_string())
            }
            None => (self.manager.default_community(), group_id.to_string()),
        };

        let members = self.group_members(&community, &group_id).await?;
        let message_id = uuid::Uuid::new_v4().to_string();
        debug!(%group_id, %message_id, members = members.len(), "Group fan-out starting");

        let semaphore = Arc::new(Semaphore::new(GROUP_FANOUT_CONCURRENCY));
        let mut tasks: JoinSet<MemberOutcome> = JoinSet::new();

        for member in members {
            if member.agent == self.username {
                continue;
            }

            let pipeline = Arc::clone(self);
            let community = Arc::clone(&community);
            let semaphore = Arc::clone(&semaphore);
            let message_id = message_id.clone();
            let group_id = group_id.clone();
            let payload = payload.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                pipeline
                    .fan_out_to_member(&community, &group_id, message_id, member, &payload)
                    .await
            });
        }

        let mut report = GroupSendReport {
            message_id: message_id.clone(),
            delivered: Vec::new(),
            queued: Vec::new(),
            failed: Vec::new(),
        };
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(MemberOutcome::Delivered(agent)) => report.delivered.push(agent),
                Ok(MemberOutcome::Queued(agent)) => report.queued.push(agent),
                Ok(MemberOutcome::Failed(agent)) => report.failed.push(agent),
                Err(e) => warn!(error = %e, "Fan-out task panicked"),
            }
        }
        report.delivered.sort();
        report.queued.sort();
        report.failed.sort();
        Ok(report)
    }

    async fn fan_out_to_member(
        &self,
        community: &Arc<Community>,
        group_id: &str,
        message_id: String,
        member: GroupMemberInfo,
        payload: &Value,
    ) -> MemberOutcome {
        let agent = member.agent.clone();

        // Members need not be direct contacts; the relay's member listing
        // carries the key and endpoint material a contact entry would.
        let contact = CachedContact {
            username: member.agent,
            public_key: member.public_key,
            endpoint: member.endpoint,
            added_at: member.joined_at,
            online: member.online,
            last_seen: None,
            key_updated_at: None,
            recovery_in_progress: false,
            community: community.name().to_string(),
        };

        let envelope = match self.seal_envelope(
            community,
            &contact,
            EnvelopeKind::Group,
            message_id,
            Some(group_id.to_string()),
            payload,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%agent, error = %e, "Could not seal group envelope");
                return MemberOutcome::Failed(agent);
            }
        };

        if !contact.online {
            return match self.queue.enqueue(agent.as_str(), community.name(), envelope) {
                Ok(()) => MemberOutcome::Queued(agent),
                Err(_) => MemberOutcome::Failed(agent),
            };
        }

        let Some(endpoint) = contact.endpoint else {
            return match self.queue.enqueue(agent.as_str(), community.name(), envelope) {
                Ok(()) => MemberOutcome::Queued(agent),
                Err(_) => MemberOutcome::Failed(agent),
            };
        };

        let (result, attempt) = post_envelope(&self.http, &endpoint, &envelope, None).await;
        self.reports
            .lock()
            .record_attempt(&envelope.message_id, &agent, attempt);

        match result {
            DeliveryResult::Delivered(_) => {
                self.reports.lock().set_final(
                    &envelope.message_id,
                    &agent,
                    DeliveryState::Delivered,
                );
                MemberOutcome::Delivered(agent)
            }
            DeliveryResult::Rejected(_) => {
                self.reports
                    .lock()
                    .set_final(&envelope.message_id, &agent, DeliveryState::Failed);
                MemberOutcome::Failed(agent)
            }
            DeliveryResult::Transient(_) => {
                match self.queue.enqueue(agent.as_str(), community.name(), envelope) {
                    Ok(()) => MemberOutcome::Queued(agent),
                    Err(_) => MemberOutcome::Failed(agent),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(agent: &str) -> GroupMemberInfo {
        GroupMemberInfo {
            agent: agent.to_string(),
            role: crate::relay::GroupRole::Member,
            joined_at: "2026-01-01T00:00:00Z".to_string(),
            public_key: "key".to_string(),
            endpoint: None,
            online: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_cache_ttl() {
        let mut cache = GroupMemberCache::new();
        cache.put("team", vec![member("alice"), member("bob")]);
        assert_eq!(cache.get("team").unwrap().len(), 2);

        tokio::time::advance(std::time::Duration::from_secs(GROUP_MEMBER_CACHE_TTL_SECS + 1))
            .await;
        assert!(cache.get("team").is_none(), "expired after TTL");
    }

    #[tokio::test]
    async fn test_member_cache_invalidate() {
        let mut cache = GroupMemberCache::new();
        cache.put("team", vec![member("alice")]);
        cache.invalidate("team");
        assert!(cache.get("team").is_none());
    }
}
