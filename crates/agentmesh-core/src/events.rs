//! Typed runtime events
//!
//! The event surface is a closed enum delivered over a broadcast channel;
//! consumers call [`crate::engine::MeshEngine::subscribe`] and match on the
//! variants they care about. There is no open-ended listener registry.

use serde_json::Value;

/// Capacity of the runtime event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Retry/delivery lifecycle states, also carried on `DeliveryStatus` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Waiting in the retry queue for its next attempt
    Pending,
    /// An attempt is in flight
    Sending,
    /// A peer acknowledged with 2xx
    Delivered,
    /// The one-hour retry horizon passed
    Expired,
    /// Attempts exhausted or a hard 4xx
    Failed,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sending => "sending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Expired => "expired",
            DeliveryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Events emitted by the client runtime.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A verified direct message arrived
    Message {
        sender: String,
        message_id: String,
        timestamp: String,
        payload: Value,
        verified: bool,
    },
    /// A verified group message arrived
    GroupMessage {
        sender: String,
        group_id: String,
        message_id: String,
        timestamp: String,
        payload: Value,
    },
    /// An admin broadcast was accepted (signature verified, first sighting)
    Broadcast {
        id: String,
        broadcast_type: String,
        sender: String,
        payload: Value,
    },
    /// A peer asked to become a contact; never auto-accepted
    ContactRequest {
        community: String,
        from: String,
        greeting: Option<String>,
        public_key: String,
    },
    /// A queued or direct delivery changed state
    DeliveryStatus {
        message_id: String,
        recipient: String,
        state: DeliveryState,
    },
    /// A community flipped to its failover relay (sticky; emitted once)
    CommunityFailover { community: String },
    /// Key rotation succeeded on some relays but not all
    KeyRotationPartial {
        rotated: Vec<String>,
        failed: Vec<String>,
    },
    /// A cached peer key differs from what the relay now reports
    KeyChanged {
        community: String,
        username: String,
        previous_key: String,
        new_key: String,
    },
}
