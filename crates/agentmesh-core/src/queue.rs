//! Bounded retry queue for undeliverable envelopes
//!
//! FIFO with re-attempts at fixed offsets from enqueue (10 s, 30 s, 90 s)
//! and a one-hour horizon. The queue itself is passive state behind a single
//! mutex; a scanner task (see the pipeline) polls [`RetryQueue::scan`]
//! every second and reports outcomes back with [`RetryQueue::complete`].
//! At most one attempt per entry is ever in flight.
//!
//! State transitions emit `DeliveryStatus` events:
//! `pending → sending → delivered | expired | failed`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::{MeshError, MeshResult};
use crate::events::{DeliveryState, MeshEvent};

/// Re-attempt offsets from enqueue time, one per attempt
pub const RETRY_OFFSETS_SECS: [u64; 3] = [10, 30, 90];
/// Maximum delivery attempts per queued message
pub const MAX_ATTEMPTS: u8 = 3;
/// Entries older than this expire on the next scan
pub const RETRY_HORIZON_SECS: u64 = 3600;

/// How an attempt handed out by [`RetryQueue::scan`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx from the peer
    Delivered,
    /// Network error, 5xx, or peer offline; eligible for another attempt
    Transient,
    /// 4xx from the peer; never retried
    Hard,
}

/// One queued envelope awaiting redelivery.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub message_id: String,
    pub recipient: String,
    pub community: String,
    pub envelope: Envelope,
    pub enqueued_at: Instant,
    pub attempts_made: u8,
    sending: bool,
}

/// Result of one scan pass.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Entries whose next attempt is due, now marked in flight
    pub due: Vec<QueuedEntry>,
    /// `(message_id, recipient)` pairs that passed the horizon this scan
    pub expired: Vec<(String, String)>,
}

/// Bounded FIFO of messages awaiting redelivery.
pub struct RetryQueue {
    entries: Mutex<VecDeque<QueuedEntry>>,
    capacity: usize,
    events: broadcast::Sender<MeshEvent>,
}

impl RetryQueue {
    pub fn new(capacity: usize, events: broadcast::Sender<MeshEvent>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn emit(&self, message_id: &str, recipient: &str, state: DeliveryState) {
        let _ = self.events.send(MeshEvent::DeliveryStatus {
            message_id: message_id.to_string(),
            recipient: recipient.to_string(),
            state,
        });
    }

    /// Add an envelope to the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the queue is at capacity; the caller surfaces
    /// this as a failed send.
    pub fn enqueue(
        &self,
        recipient: impl Into<String>,
        community: impl Into<String>,
        envelope: Envelope,
    ) -> MeshResult<()> {
        let message_id = envelope.message_id.clone();
        let recipient = recipient.into();
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity {
                return Err(MeshError::QueueFull);
            }
            entries.push_back(QueuedEntry {
                message_id: message_id.clone(),
                recipient: recipient.clone(),
                community: community.into(),
                envelope,
                enqueued_at: Instant::now(),
                attempts_made: 0,
                sending: false,
            });
        }
        debug!(%message_id, %recipient, "Message enqueued for retry");
        self.emit(&message_id, &recipient, DeliveryState::Pending);
        Ok(())
    }

    /// One scan pass: expire entries past the horizon, then hand out every
    /// entry whose next attempt offset has elapsed, marking it in flight.
    pub fn scan(&self) -> ScanResult {
        let now = Instant::now();
        let mut result = ScanResult::default();

        {
            let mut entries = self.entries.lock();
            entries.retain(|entry| {
                if entry.sending {
                    return true;
                }
                if now.duration_since(entry.enqueued_at).as_secs() >= RETRY_HORIZON_SECS {
                    result
                        .expired
                        .push((entry.message_id.clone(), entry.recipient.clone()));
                    return false;
                }
                true
            });

            for entry in entries.iter_mut() {
                if entry.sending || entry.attempts_made >= MAX_ATTEMPTS {
                    continue;
                }
                let offset = RETRY_OFFSETS_SECS[entry.attempts_made as usize];
                if now.duration_since(entry.enqueued_at).as_secs() >= offset {
                    entry.sending = true;
                    result.due.push(entry.clone());
                }
            }
        }

        for (message_id, recipient) in &result.expired {
            debug!(%message_id, "Queued message expired");
            self.emit(message_id, recipient, DeliveryState::Expired);
        }
        for entry in &result.due {
            self.emit(&entry.message_id, &entry.recipient, DeliveryState::Sending);
        }

        result
    }

    /// Report the outcome of an attempt handed out by [`scan`]. Returns the
    /// terminal state when the entry left the queue.
    pub fn complete(
        &self,
        message_id: &str,
        recipient: &str,
        outcome: AttemptOutcome,
    ) -> Option<DeliveryState> {
        let terminal = {
            let mut entries = self.entries.lock();
            let pos = entries
                .iter()
                .position(|e| e.message_id == message_id && e.recipient == recipient)?;

            match outcome {
                AttemptOutcome::Delivered => {
                    entries.remove(pos);
                    Some(DeliveryState::Delivered)
                }
                AttemptOutcome::Hard => {
                    entries.remove(pos);
                    Some(DeliveryState::Failed)
                }
                AttemptOutcome::Transient => {
                    let entry = &mut entries[pos];
                    entry.sending = false;
                    entry.attempts_made += 1;
                    if entry.attempts_made >= MAX_ATTEMPTS {
                        entries.remove(pos);
                        Some(DeliveryState::Failed)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(state) = terminal {
            debug!(%message_id, %state, "Queued message finished");
            self.emit(message_id, recipient, state);
        }
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeKind, EnvelopePayload};
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use serde_json::json;
    use std::time::Duration;

    fn queue(capacity: usize) -> (RetryQueue, broadcast::Receiver<MeshEvent>) {
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (RetryQueue::new(capacity, tx), rx)
    }

    fn envelope() -> Envelope {
        Envelope::new(
            EnvelopeKind::Direct,
            "alice",
            "bob",
            EnvelopePayload::Plain(json!({"x": 1})),
        )
    }

    fn drain_states(rx: &mut broadcast::Receiver<MeshEvent>) -> Vec<DeliveryState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let MeshEvent::DeliveryStatus { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_capacity_overflow_rejected() {
        let (queue, _rx) = queue(2);
        queue.enqueue("bob", "home", envelope()).unwrap();
        queue.enqueue("bob", "home", envelope()).unwrap();
        assert!(matches!(
            queue.enqueue("bob", "home", envelope()),
            Err(MeshError::QueueFull)
        ));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_schedule() {
        let (queue, _rx) = queue(10);
        queue.enqueue("bob", "home", envelope()).unwrap();

        // Not due before the first offset
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.scan().due.is_empty());

        // First attempt at 10s
        tokio::time::advance(Duration::from_secs(5)).await;
        let due = queue.scan().due;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts_made, 0);

        // In flight: no duplicate attempt handed out
        assert!(queue.scan().due.is_empty());

        let entry = &due[0];
        queue.complete(&entry.message_id, &entry.recipient, AttemptOutcome::Transient);

        // Second attempt at 30s from enqueue
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(queue.scan().due.is_empty());
        tokio::time::advance(Duration::from_secs(10)).await;
        let due = queue.scan().due;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts_made, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_is_failed() {
        let (queue, mut rx) = queue(10);
        queue.enqueue("bob", "home", envelope()).unwrap();

        for offset in [10u64, 30, 90] {
            tokio::time::advance(Duration::from_secs(offset)).await;
            let due = queue.scan().due;
            assert_eq!(due.len(), 1, "attempt at {offset}s");
            queue.complete(&due[0].message_id, &due[0].recipient, AttemptOutcome::Transient);
        }

        assert!(queue.is_empty());
        let states = drain_states(&mut rx);
        assert_eq!(states.last(), Some(&DeliveryState::Failed));
        // Exactly three sending transitions happened
        assert_eq!(
            states.iter().filter(|s| **s == DeliveryState::Sending).count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_removes_and_emits_chain() {
        let (queue, mut rx) = queue(10);
        queue.enqueue("bob", "home", envelope()).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let due = queue.scan().due;
        queue.complete(&due[0].message_id, &due[0].recipient, AttemptOutcome::Delivered);

        assert!(queue.is_empty());
        assert_eq!(
            drain_states(&mut rx),
            vec![
                DeliveryState::Pending,
                DeliveryState::Sending,
                DeliveryState::Delivered
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_failure_not_retried() {
        let (queue, mut rx) = queue(10);
        queue.enqueue("bob", "home", envelope()).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let due = queue.scan().due;
        queue.complete(&due[0].message_id, &due[0].recipient, AttemptOutcome::Hard);

        assert!(queue.is_empty());
        assert_eq!(drain_states(&mut rx).last(), Some(&DeliveryState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_horizon_expiry() {
        let (queue, mut rx) = queue(10);
        queue.enqueue("bob", "home", envelope()).unwrap();

        tokio::time::advance(Duration::from_secs(RETRY_HORIZON_SECS + 1)).await;
        assert!(queue.scan().due.is_empty());
        assert!(queue.is_empty());
        assert_eq!(drain_states(&mut rx).last(), Some(&DeliveryState::Expired));
    }
}
