//! In-memory delivery reports
//!
//! Every delivery attempt — direct or from the retry queue — appends an
//! entry to the message's report. The log holds at most 500 reports with
//! FIFO eviction; nothing here is persisted.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::events::DeliveryState;

/// Maximum retained reports before FIFO eviction
pub const REPORT_CAPACITY: usize = 500;

/// One delivery attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    /// ISO-8601 UTC time the attempt started
    pub timestamp: String,
    /// Result of the presence check that gated this attempt, if one ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_check: Option<bool>,
    /// Endpoint the attempt targeted
    pub endpoint: String,
    /// HTTP status, when the peer responded at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Error description for network-level failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Ordered attempt history for one (message, recipient) pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub message_id: String,
    pub recipient: String,
    pub attempts: Vec<DeliveryAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<String>,
}

/// Bounded log of delivery reports.
#[derive(Debug, Default)]
pub struct DeliveryReportLog {
    reports: HashMap<String, DeliveryReport>,
    order: VecDeque<String>,
}

fn key(message_id: &str, recipient: &str) -> String {
    format!("{message_id}:{recipient}")
}

impl DeliveryReportLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attempt, creating the report on first sight and evicting
    /// the oldest report past capacity.
    pub fn record_attempt(&mut self, message_id: &str, recipient: &str, attempt: DeliveryAttempt) {
        let key = key(message_id, recipient);
        if !self.reports.contains_key(&key) {
            if self.order.len() >= REPORT_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.reports.remove(&evicted);
                }
            }
            self.order.push_back(key.clone());
            self.reports.insert(
                key.clone(),
                DeliveryReport {
                    message_id: message_id.to_string(),
                    recipient: recipient.to_string(),
                    attempts: Vec::new(),
                    final_status: None,
                },
            );
        }
        if let Some(report) = self.reports.get_mut(&key) {
            report.attempts.push(attempt);
        }
    }

    /// Mark the terminal status of a report, if it exists.
    pub fn set_final(&mut self, message_id: &str, recipient: &str, state: DeliveryState) {
        if let Some(report) = self.reports.get_mut(&key(message_id, recipient)) {
            report.final_status = Some(state.to_string());
        }
    }

    /// All reports for one message id (group sends share an id across
    /// recipients).
    pub fn reports_for(&self, message_id: &str) -> Vec<DeliveryReport> {
        self.order
            .iter()
            .filter_map(|k| self.reports.get(k))
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(status: Option<u16>) -> DeliveryAttempt {
        DeliveryAttempt {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            presence_check: Some(true),
            endpoint: "https://bob.example.org/inbox".to_string(),
            http_status: status,
            error: None,
            duration_ms: 12,
        }
    }

    #[test]
    fn test_attempts_ordered() {
        let mut log = DeliveryReportLog::new();
        log.record_attempt("m1", "bob", attempt(None));
        log.record_attempt("m1", "bob", attempt(Some(200)));
        log.set_final("m1", "bob", DeliveryState::Delivered);

        let reports = log.reports_for("m1");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].attempts.len(), 2);
        assert_eq!(reports[0].attempts[1].http_status, Some(200));
        assert_eq!(reports[0].final_status.as_deref(), Some("delivered"));
    }

    #[test]
    fn test_group_share_one_message_id() {
        let mut log = DeliveryReportLog::new();
        log.record_attempt("m1", "bob", attempt(Some(200)));
        log.record_attempt("m1", "carol", attempt(None));
        assert_eq!(log.reports_for("m1").len(), 2);
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let mut log = DeliveryReportLog::new();
        for i in 0..(REPORT_CAPACITY + 10) {
            log.record_attempt(&format!("m{i}"), "bob", attempt(None));
        }
        assert_eq!(log.len(), REPORT_CAPACITY);
        assert!(log.reports_for("m0").is_empty(), "oldest evicted");
        assert!(!log.reports_for("m509").is_empty());
    }
}
