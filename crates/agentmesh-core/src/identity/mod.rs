//! Agent identity: long-lived Ed25519 signing keys and the X25519
//! encryption keys derived from them.
//!
//! Every agent holds one Ed25519 keypair per community (or a single shared
//! one). The same keypair serves two roles:
//!
//! - **Signing**: envelopes and relay API requests are signed with the
//!   Ed25519 key directly.
//! - **Encryption**: an X25519 keypair is derived from the Ed25519 keypair
//!   via the standard birational map, so peers can run ECDH knowing only
//!   each other's published signing key.

pub mod exchange;
pub mod keypair;

pub use exchange::{derive_exchange_public, derive_exchange_secret};
pub use keypair::{AgentKeypair, AgentPublicKey};
