//! Signed wire envelopes
//!
//! The envelope is the unit of agent-to-agent communication. It is a JSON
//! document signed over its canonical serialization (all fields except
//! `signature`, keys sorted, no whitespace — see [`crate::canonical`]), with
//! the payload either pairwise-encrypted (`ciphertext` + `nonce`) or plain
//! JSON for the relay-mediated contact workflow.
//!
//! ## Decode gates
//!
//! Inbound envelopes pass through, in order: version check (major must
//! match, newer minors accepted), recipient check (unicast types only),
//! clock-skew gate (±5 minutes), signature verification, then decryption.
//! Every failure is a hard reject.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::to_canonical_bytes;
use crate::crypto::{SealedBytes, NONCE_SIZE};
use crate::error::{MeshError, MeshResult};
use crate::identity::{AgentKeypair, AgentPublicKey};

/// Current envelope protocol version
pub const ENVELOPE_VERSION: &str = "2.0";

/// Maximum tolerated difference between an envelope timestamp and local time
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Closed set of envelope types. Decoders dispatch on this tag and reject
/// anything unknown at deserialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    Direct,
    Group,
    Broadcast,
    ContactRequest,
    ContactResponse,
    Revocation,
    Receipt,
}

impl EnvelopeKind {
    /// Whether envelopes of this kind are addressed to exactly one agent.
    /// Broadcasts and revocations fan out to everyone and skip the
    /// recipient gate.
    pub fn is_unicast(&self) -> bool {
        !matches!(self, EnvelopeKind::Broadcast | EnvelopeKind::Revocation)
    }
}

/// Envelope payload: either sealed for the recipient or plain JSON
/// (contact workflow only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopePayload {
    /// Pairwise-encrypted content: base64 ciphertext and base64 12-byte nonce
    Sealed { ciphertext: String, nonce: String },
    /// Unencrypted JSON content
    Plain(Value),
}

impl EnvelopePayload {
    /// Wrap sealed bytes into the wire representation.
    pub fn from_sealed(sealed: &SealedBytes) -> Self {
        EnvelopePayload::Sealed {
            ciphertext: BASE64.encode(&sealed.ciphertext),
            nonce: BASE64.encode(sealed.nonce),
        }
    }

    /// Decode the wire representation back into raw sealed bytes.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the payload is plain or the base64/nonce
    /// length is wrong.
    pub fn to_sealed(&self) -> MeshResult<SealedBytes> {
        match self {
            EnvelopePayload::Sealed { ciphertext, nonce } => {
                let ciphertext = BASE64
                    .decode(ciphertext)
                    .map_err(|_| MeshError::Validation("ciphertext is not base64".into()))?;
                let nonce_bytes = BASE64
                    .decode(nonce)
                    .map_err(|_| MeshError::Validation("nonce is not base64".into()))?;
                let nonce: [u8; NONCE_SIZE] = nonce_bytes
                    .try_into()
                    .map_err(|_| MeshError::Validation("nonce must be 12 bytes".into()))?;
                Ok(SealedBytes { ciphertext, nonce })
            }
            EnvelopePayload::Plain(_) => {
                Err(MeshError::Validation("payload is not encrypted".into()))
            }
        }
    }
}

/// A signed, optionally-encrypted unit of communication between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Protocol version, `"major.minor"`
    pub version: String,
    /// Envelope type tag
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// UUIDv4 identifying this message; doubles as AEAD associated data
    pub message_id: String,
    /// Sender username
    pub sender: String,
    /// Recipient username (`*` for broadcast fan-out)
    pub recipient: String,
    /// ISO-8601 UTC creation time
    pub timestamp: String,
    /// Group id, present on `group` envelopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Sealed or plain payload
    pub payload: EnvelopePayload,
    /// Base64 Ed25519 signature over the canonical serialization of every
    /// other field
    pub signature: String,
}

impl Envelope {
    /// Construct an unsigned envelope with a fresh message id and timestamp.
    pub fn new(
        kind: EnvelopeKind,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: EnvelopePayload,
    ) -> Self {
        Self::with_message_id(kind, Uuid::new_v4().to_string(), sender, recipient, payload)
    }

    /// Construct an unsigned envelope with a caller-supplied message id
    /// (group fan-out shares one id across the batch).
    pub fn with_message_id(
        kind: EnvelopeKind,
        message_id: String,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: EnvelopePayload,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            kind,
            message_id,
            sender: sender.into(),
            recipient: recipient.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            group_id: None,
            payload,
            signature: String::new(),
        }
    }

    /// The canonical bytes a signature covers: this envelope minus the
    /// `signature` field.
    pub fn signing_bytes(&self) -> MeshResult<Vec<u8>> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        if let Value::Object(ref mut map) = value {
            map.remove("signature");
        }
        to_canonical_bytes(&value)
    }

    /// Sign the envelope in place with the sender's identity key.
    pub fn sign(&mut self, keypair: &AgentKeypair) -> MeshResult<()> {
        self.signature = keypair.sign_base64(&self.signing_bytes()?);
        Ok(())
    }

    /// Verify the signature against the claimed sender's public key.
    ///
    /// # Errors
    ///
    /// Returns `SignatureInvalid` on any mismatch.
    pub fn verify_signature(&self, key: &AgentPublicKey) -> MeshResult<()> {
        key.verify_base64(&self.signing_bytes()?, &self.signature)
    }

    /// Gate 1: reject a different major version; accept unrecognized minors.
    pub fn validate_version(&self) -> MeshResult<()> {
        let major = self.version.split('.').next().unwrap_or("");
        let current_major = ENVELOPE_VERSION.split('.').next().unwrap_or("");
        if major != current_major {
            return Err(MeshError::Validation(format!(
                "unsupported envelope version {}",
                self.version
            )));
        }
        Ok(())
    }

    /// Gate 2: unicast envelopes must name the local agent.
    pub fn validate_recipient(&self, local_username: &str) -> MeshResult<()> {
        if self.kind.is_unicast() && self.recipient != local_username {
            return Err(MeshError::Validation(format!(
                "envelope addressed to {:?}, not us",
                self.recipient
            )));
        }
        Ok(())
    }

    /// Gate 3: reject timestamps more than five minutes from `now`.
    pub fn validate_timestamp(&self, now: DateTime<Utc>) -> MeshResult<()> {
        let ts = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|_| MeshError::Validation("unparseable envelope timestamp".into()))?
            .with_timezone(&Utc);
        let skew = (now - ts).num_seconds().abs();
        if skew > MAX_CLOCK_SKEW_SECS {
            return Err(MeshError::Validation(format!(
                "envelope timestamp outside clock-skew window ({skew}s)"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn signed_direct(sender_kp: &AgentKeypair) -> Envelope {
        let mut env = Envelope::new(
            EnvelopeKind::Direct,
            "alice",
            "bob",
            EnvelopePayload::Sealed {
                ciphertext: BASE64.encode(b"ct"),
                nonce: BASE64.encode([0u8; NONCE_SIZE]),
            },
        );
        env.sign(sender_kp).unwrap();
        env
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = AgentKeypair::generate();
        let env = signed_direct(&kp);
        assert!(env.verify_signature(&kp.public_key()).is_ok());
    }

    #[test]
    fn test_verify_rejects_field_tampering() {
        let kp = AgentKeypair::generate();
        let key = kp.public_key();

        let mut env = signed_direct(&kp);
        env.sender = "mallory".to_string();
        assert!(env.verify_signature(&key).is_err());

        let mut env = signed_direct(&kp);
        env.recipient = "mallory".to_string();
        assert!(env.verify_signature(&key).is_err());

        let mut env = signed_direct(&kp);
        env.message_id = Uuid::new_v4().to_string();
        assert!(env.verify_signature(&key).is_err());

        let mut env = signed_direct(&kp);
        env.payload = EnvelopePayload::Sealed {
            ciphertext: BASE64.encode(b"other"),
            nonce: BASE64.encode([1u8; NONCE_SIZE]),
        };
        assert!(env.verify_signature(&key).is_err());
    }

    #[test]
    fn test_signing_bytes_stable_across_wire_roundtrip() {
        // Re-serializing the decoded envelope minus signature must be
        // bitwise identical to what the signer signed.
        let kp = AgentKeypair::generate();
        let env = signed_direct(&kp);
        let wire = serde_json::to_string(&env).unwrap();
        let decoded: Envelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(env.signing_bytes().unwrap(), decoded.signing_bytes().unwrap());
        assert!(decoded.verify_signature(&kp.public_key()).is_ok());
    }

    #[test]
    fn test_version_gate() {
        let kp = AgentKeypair::generate();
        let mut env = signed_direct(&kp);
        assert!(env.validate_version().is_ok());

        env.version = "2.7".to_string();
        assert!(env.validate_version().is_ok(), "newer minor accepted");

        env.version = "3.0".to_string();
        assert!(env.validate_version().is_err());

        env.version = "1.0".to_string();
        assert!(env.validate_version().is_err());
    }

    #[test]
    fn test_recipient_gate() {
        let kp = AgentKeypair::generate();
        let env = signed_direct(&kp);
        assert!(env.validate_recipient("bob").is_ok());
        assert!(env.validate_recipient("carol").is_err());
    }

    #[test]
    fn test_broadcast_skips_recipient_gate() {
        let mut env = Envelope::new(
            EnvelopeKind::Broadcast,
            "admin",
            "*",
            EnvelopePayload::Plain(json!({"notice": "maintenance"})),
        );
        let kp = AgentKeypair::generate();
        env.sign(&kp).unwrap();
        assert!(env.validate_recipient("anyone").is_ok());
    }

    #[test]
    fn test_clock_skew_gate() {
        let kp = AgentKeypair::generate();
        let env = signed_direct(&kp);
        let ts = DateTime::parse_from_rfc3339(&env.timestamp)
            .unwrap()
            .with_timezone(&Utc);

        assert!(env.validate_timestamp(ts).is_ok());
        assert!(env.validate_timestamp(ts + Duration::minutes(4)).is_ok());
        assert!(env.validate_timestamp(ts + Duration::minutes(6)).is_err());
        assert!(env.validate_timestamp(ts - Duration::minutes(6)).is_err());
    }

    #[test]
    fn test_kind_tags_on_wire() {
        let env = Envelope::new(
            EnvelopeKind::ContactRequest,
            "alice",
            "bob",
            EnvelopePayload::Plain(json!({"greeting": "Hi Bob!"})),
        );
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], "contact-request");
        assert_eq!(wire["messageId"], env.message_id);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let wire = json!({
            "version": "2.0",
            "type": "carrier-pigeon",
            "messageId": "x",
            "sender": "alice",
            "recipient": "bob",
            "timestamp": "2026-01-01T00:00:00Z",
            "payload": {"a": 1},
            "signature": ""
        });
        assert!(serde_json::from_value::<Envelope>(wire).is_err());
    }

    #[test]
    fn test_sealed_payload_roundtrip() {
        let sealed = SealedBytes {
            ciphertext: vec![1, 2, 3],
            nonce: [9u8; NONCE_SIZE],
        };
        let payload = EnvelopePayload::from_sealed(&sealed);
        assert_eq!(payload.to_sealed().unwrap(), sealed);
    }

    #[test]
    fn test_plain_payload_not_sealed() {
        let payload = EnvelopePayload::Plain(json!({"greeting": "hello"}));
        assert!(payload.to_sealed().is_err());
    }
}
