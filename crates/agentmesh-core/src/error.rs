//! Error types for the agentmesh client runtime

use thiserror::Error;

/// Main error type for agentmesh client operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Malformed input (bad username, oversized greeting, bad envelope field)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid signature, stale timestamp, revoked or unknown agent
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Agent, contact, group, or community not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate registration, existing contact pair, duplicate message id
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A relay rate limit was tripped
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the limit window resets
        retry_after_secs: u64,
    },

    /// Network failure or 5xx from a relay or peer; drives retry and failover
    #[error("Transport error: {0}")]
    Transport(String),

    /// Decryption or key-derivation failure; never retried
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Retry queue is at capacity
    #[error("Retry queue is full")]
    QueueFull,

    /// Retry horizon exceeded
    #[error("Message expired in retry queue")]
    Expired,

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Recipient is not an accepted contact
    #[error("Not a contact: {0}")]
    NotAContact(String),

    /// No community matches the given name or hostname
    #[error("Unknown community: {0}")]
    UnknownCommunity(String),

    /// Configuration problem (missing key, no communities, bad URL)
    #[error("Configuration error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether this failure should feed retry and failover accounting.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeshError::Transport(_))
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;
