//! Pairwise end-to-end encryption using ECDH + HKDF-SHA256 + AES-256-GCM
//!
//! Each (sender, recipient) pair shares a symmetric key derived from the
//! X25519 exchange of their identity keys. The key is direction-independent:
//! HKDF's info parameter orders the two usernames alphabetically, so both
//! sides derive the same bytes.
//!
//! Every ciphertext is bound to its envelope by using the message id as
//! AES-GCM associated data; moving a ciphertext into a different envelope
//! fails authentication on open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{MeshError, MeshResult};
use crate::identity::{derive_exchange_public, derive_exchange_secret, AgentKeypair, AgentPublicKey};

/// HKDF salt for pairwise key derivation (network protocol constant)
pub const PAIR_KEY_SALT: &[u8] = b"cc4me-e2e-v1";

/// Nonce size for AES-256-GCM (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Derive the 32-byte pairwise key shared between `our` keypair and a peer.
///
/// The HKDF info parameter is `"{a}:{b}"` with the two usernames sorted
/// alphabetically, binding the key to the specific pair of agents.
///
/// # Errors
///
/// Returns `Crypto` if HKDF expansion fails.
pub fn derive_pair_key(
    our: &AgentKeypair,
    our_name: &str,
    their: &AgentPublicKey,
    their_name: &str,
) -> MeshResult<[u8; 32]> {
    let shared = derive_exchange_secret(our).diffie_hellman(&derive_exchange_public(their));

    let (a, b) = if our_name <= their_name {
        (our_name, their_name)
    } else {
        (their_name, our_name)
    };
    let info = format!("{a}:{b}");

    let hk = Hkdf::<Sha256>::new(Some(PAIR_KEY_SALT), shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(info.as_bytes(), &mut key)
        .map_err(|_| MeshError::Crypto("HKDF expansion failed".to_string()))?;

    Ok(key)
}

/// Ciphertext plus the fresh nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBytes {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// AEAD wrapper for one pairwise key.
pub struct PairwiseCrypto {
    cipher: Aes256Gcm,
}

impl PairwiseCrypto {
    /// Create a cipher instance for the given 32-byte pairwise key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Encrypt `plaintext` with a fresh random nonce, binding it to `aad`
    /// (the envelope's message id bytes).
    ///
    /// # Errors
    ///
    /// Returns `Crypto` if encryption fails.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> MeshResult<SealedBytes> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| MeshError::Crypto("AES-GCM encryption failed".to_string()))?;

        Ok(SealedBytes { ciphertext, nonce })
    }

    /// Decrypt a ciphertext sealed by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns `Crypto` if the key, nonce, AAD, or ciphertext do not match —
    /// a hard reject, never retried.
    pub fn open(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
    ) -> MeshResult<Vec<u8>> {
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| MeshError::Crypto("AES-GCM decryption failed".to_string()))
    }
}
