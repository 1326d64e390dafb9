//! Community management
//!
//! An agent may belong to several independent networks, each anchored on its
//! own relay pair. This module owns everything per-community: the failover
//! accounting, the signing identity, the contact cache, the cached admin
//! keys, and the heartbeat schedule. All relay traffic flows through
//! [`CommunityManager::call_api`] so every response feeds the failover
//! state machine.

pub mod cache;
pub mod failover;
pub mod manager;

pub use cache::{CachedContact, ContactCache, KeyChange};
pub use failover::{FailoverState, RelayRole};
pub use manager::{Community, CommunityManager, RotationOutcome};
