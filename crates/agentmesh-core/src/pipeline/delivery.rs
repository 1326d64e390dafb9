//! Direct P2P envelope delivery
//!
//! One POST of a signed envelope to a peer's HTTPS inbox with a hard
//! timeout. The result classification drives the caller: 2xx is delivered,
//! 4xx is a hard failure (never retried), anything else is transient and
//! feeds the retry queue.

use std::time::Instant;

use reqwest::Client;
use tracing::debug;

use crate::envelope::Envelope;
use crate::pipeline::report::DeliveryAttempt;

/// Classified outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Peer acknowledged with 2xx
    Delivered(u16),
    /// Peer rejected with 4xx; the envelope is not retried
    Rejected(u16),
    /// Network failure, timeout, or 5xx
    Transient(String),
}

/// POST an envelope to a peer endpoint and build the report entry for the
/// attempt. `presence_check` records the gate that preceded this attempt,
/// if one ran.
pub async fn post_envelope(
    http: &Client,
    endpoint: &str,
    envelope: &Envelope,
    presence_check: Option<bool>,
) -> (DeliveryResult, DeliveryAttempt) {
    let started = Instant::now();
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

    let (outcome, http_status) = match http.post(endpoint).json(envelope).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let outcome = if (200..300).contains(&status) {
                DeliveryResult::Delivered(status)
            } else if (400..500).contains(&status) {
                DeliveryResult::Rejected(status)
            } else {
                DeliveryResult::Transient(format!("peer returned {status}"))
            };
            (outcome, Some(status))
        }
        Err(e) => (DeliveryResult::Transient(e.to_string()), None),
    };

    debug!(
        message_id = %envelope.message_id,
        endpoint,
        ?outcome,
        "Delivery attempt finished"
    );

    let attempt = DeliveryAttempt {
        timestamp,
        presence_check,
        endpoint: endpoint.to_string(),
        http_status,
        error: match &outcome {
            DeliveryResult::Transient(e) => Some(e.clone()),
            _ => None,
        },
        duration_ms: started.elapsed().as_millis() as u64,
    };

    (outcome, attempt)
}
