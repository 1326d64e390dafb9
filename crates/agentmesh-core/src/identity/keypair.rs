//! Ed25519 agent keypairs with SPKI / PKCS#8 base64 encodings
//!
//! Public keys travel as base64 of SPKI DER; private keys as base64 of
//! PKCS#8 DER. Both wrap the fixed Ed25519 algorithm identifier around the
//! 32-byte raw key, so the codecs here are prefix checks rather than a full
//! ASN.1 parser.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410)
const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// DER prefix of an Ed25519 PKCS#8 v1 PrivateKeyInfo (RFC 8410)
const PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

/// Long-lived Ed25519 identity keypair for one agent.
///
/// Private key material never leaves this type except through
/// [`AgentKeypair::to_pkcs8_base64`], which callers hand to the external
/// secure key store.
pub struct AgentKeypair {
    signing: SigningKey,
}

impl AgentKeypair {
    /// Generate a new random keypair using the OS random number generator.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build a keypair from a raw 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Decode a keypair from base64 PKCS#8 DER.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the base64, DER framing, or key length is wrong.
    pub fn from_pkcs8_base64(encoded: &str) -> MeshResult<Self> {
        let der = BASE64
            .decode(encoded.trim())
            .map_err(|e| MeshError::Validation(format!("invalid private key base64: {e}")))?;
        if der.len() != PKCS8_PREFIX.len() + 32 || der[..PKCS8_PREFIX.len()] != PKCS8_PREFIX {
            return Err(MeshError::Validation(
                "private key is not Ed25519 PKCS#8".to_string(),
            ));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&der[PKCS8_PREFIX.len()..]);
        Ok(Self::from_seed(&seed))
    }

    /// Encode the private key as base64 PKCS#8 DER for external storage.
    #[must_use]
    pub fn to_pkcs8_base64(&self) -> String {
        let mut der = Vec::with_capacity(PKCS8_PREFIX.len() + 32);
        der.extend_from_slice(&PKCS8_PREFIX);
        der.extend_from_slice(self.signing.as_bytes());
        BASE64.encode(der)
    }

    /// The raw 32-byte seed. Used only for deriving the exchange secret.
    pub(crate) fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The public half of this keypair.
    #[must_use]
    pub fn public_key(&self) -> AgentPublicKey {
        AgentPublicKey(self.signing.verifying_key())
    }

    /// Sign a message, returning the 64-byte Ed25519 signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Sign a message and return the signature as base64.
    #[must_use]
    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.sign(message))
    }
}

impl Clone for AgentKeypair {
    fn clone(&self) -> Self {
        Self {
            signing: SigningKey::from_bytes(self.signing.as_bytes()),
        }
    }
}

impl fmt::Debug for AgentKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print private key material
        f.debug_struct("AgentKeypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Public half of an agent identity. Safe to share; carried on the wire as
/// base64 SPKI DER.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AgentPublicKey(VerifyingKey);

impl AgentPublicKey {
    /// Decode from base64 SPKI DER.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the base64, DER framing, or curve point is bad.
    pub fn from_spki_base64(encoded: &str) -> MeshResult<Self> {
        let der = BASE64
            .decode(encoded.trim())
            .map_err(|e| MeshError::Validation(format!("invalid public key base64: {e}")))?;
        if der.len() != SPKI_PREFIX.len() + 32 || der[..SPKI_PREFIX.len()] != SPKI_PREFIX {
            return Err(MeshError::Validation(
                "public key is not Ed25519 SPKI".to_string(),
            ));
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&der[SPKI_PREFIX.len()..]);
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|_| MeshError::Validation("invalid Ed25519 public key".to_string()))?;
        Ok(Self(key))
    }

    /// Encode as base64 SPKI DER.
    #[must_use]
    pub fn to_spki_base64(&self) -> String {
        let mut der = Vec::with_capacity(SPKI_PREFIX.len() + 32);
        der.extend_from_slice(&SPKI_PREFIX);
        der.extend_from_slice(self.0.as_bytes());
        BASE64.encode(der)
    }

    /// The raw 32-byte compressed Edwards point.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    /// Verify a 64-byte signature over `message`.
    ///
    /// # Errors
    ///
    /// Returns `SignatureInvalid` on mismatch.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> MeshResult<()> {
        let sig: [u8; 64] = signature
            .try_into()
            .map_err(|_| MeshError::SignatureInvalid("signature must be 64 bytes".to_string()))?;
        self.0
            .verify(message, &Signature::from_bytes(&sig))
            .map_err(|_| MeshError::SignatureInvalid("Ed25519 verification failed".to_string()))
    }

    /// Verify a base64-encoded signature over `message`.
    pub fn verify_base64(&self, message: &[u8], signature_b64: &str) -> MeshResult<()> {
        let sig = BASE64
            .decode(signature_b64)
            .map_err(|_| MeshError::SignatureInvalid("signature is not base64".to_string()))?;
        self.verify(message, &sig)
    }
}

impl fmt::Debug for AgentPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.as_bytes();
        write!(
            f,
            "AgentPublicKey({:02x}{:02x}{:02x}{:02x}...)",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }
}

impl fmt::Display for AgentPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_spki_base64())
    }
}

impl Serialize for AgentPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_spki_base64())
    }
}

impl<'de> Deserialize<'de> for AgentPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_spki_base64(&s).map_err(serde::de::Error::custom)
    }
}
