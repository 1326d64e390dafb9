//! agentmesh client runtime
//!
//! Peer-to-peer agent messaging with end-to-end encryption. Agents are
//! identified by short usernames bound to long-lived Ed25519 keypairs; a
//! lightweight relay per community coordinates identity, contacts, and
//! presence, while message content travels directly between agents over
//! authenticated HTTPS and never touches a relay.
//!
//! ## Core pieces
//!
//! - [`identity`] / [`crypto`]: Ed25519 signing, the Ed25519→X25519
//!   derivation, and pairwise AES-256-GCM.
//! - [`envelope`]: the signed wire envelope and its decode gates.
//! - [`community`]: per-community relay clients, sticky failover,
//!   heartbeats, and the persisted contact caches.
//! - [`queue`] / [`pipeline`]: the retry queue and the send/receive/group
//!   fan-out pipeline.
//! - [`engine`]: the facade the host application drives.

pub mod canonical;
pub mod community;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod identity;
pub mod pipeline;
pub mod queue;
pub mod relay;
pub mod types;

// Re-exports
pub use community::{CachedContact, Community, CommunityManager, ContactCache};
pub use config::{CommunityConfig, MeshConfig};
pub use crypto::{derive_pair_key, PairwiseCrypto, PAIR_KEY_SALT};
pub use engine::MeshEngine;
pub use envelope::{Envelope, EnvelopeKind, EnvelopePayload, ENVELOPE_VERSION};
pub use error::{MeshError, MeshResult};
pub use events::{DeliveryState, MeshEvent};
pub use identity::{AgentKeypair, AgentPublicKey};
pub use pipeline::MessagePipeline;
pub use queue::RetryQueue;
pub use types::{GroupSendReport, SendOutcome, SendStatus};
