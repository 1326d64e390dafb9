//! Shared value types for the client runtime

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Maximum username length (bytes; usernames are ASCII)
pub const USERNAME_MAX_LEN: usize = 32;

/// Check a username against the network rules: lowercase alphanumeric start,
/// then lowercase alphanumerics, `_`, or `-`, at most 32 characters total.
pub fn is_valid_username(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > USERNAME_MAX_LEN {
        return false;
    }
    let first = bytes[0];
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_' || *b == b'-')
}

/// Validate a username, returning a [`MeshError::Validation`] on failure.
pub fn validate_username(name: &str) -> MeshResult<()> {
    if is_valid_username(name) {
        Ok(())
    } else {
        Err(MeshError::Validation(format!("invalid username: {name:?}")))
    }
}

/// A recipient name, possibly qualified with a relay hostname
/// (`bob` or `bob@relay.example.org`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientName {
    /// Bare username
    pub username: String,
    /// Relay hostname qualifier, if the name was written `user@hostname`
    pub hostname: Option<String>,
}

impl RecipientName {
    /// Parse a possibly-qualified recipient name.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the username part is malformed or the
    /// hostname part is empty.
    pub fn parse(raw: &str) -> MeshResult<Self> {
        match raw.split_once('@') {
            Some((user, host)) => {
                validate_username(user)?;
                if host.is_empty() {
                    return Err(MeshError::Validation(format!(
                        "empty hostname in qualified name: {raw:?}"
                    )));
                }
                Ok(Self {
                    username: user.to_string(),
                    hostname: Some(host.to_string()),
                })
            }
            None => {
                validate_username(raw)?;
                Ok(Self {
                    username: raw.to_string(),
                    hostname: None,
                })
            }
        }
    }
}

/// Final outcome of a send operation, surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// The peer acknowledged the envelope with a 2xx
    Delivered,
    /// The envelope was placed in the retry queue
    Queued,
    /// The send failed and will not be retried
    Failed,
}

/// Result of sending a direct message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    /// Terminal (or queued) status of the send
    pub status: SendStatus,
    /// Message id allocated for the envelope, if one was constructed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Human-readable reason when `status == Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn delivered(message_id: String) -> Self {
        Self {
            status: SendStatus::Delivered,
            message_id: Some(message_id),
            error: None,
        }
    }

    pub fn queued(message_id: String) -> Self {
        Self {
            status: SendStatus::Queued,
            message_id: Some(message_id),
            error: None,
        }
    }

    pub fn failed(message_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            message_id,
            error: Some(error.into()),
        }
    }
}

/// Result of a group fan-out, listing each member by terminal bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSendReport {
    /// Message id shared by every per-member envelope in the batch
    pub message_id: String,
    /// Members whose endpoint acknowledged with 2xx
    pub delivered: Vec<String>,
    /// Members enqueued for retry (offline or transient failure)
    pub queued: Vec<String>,
    /// Members that failed hard (4xx or queue full)
    pub failed: Vec<String>,
}
