//! Verification-code delivery interface
//!
//! Actual email transport is an external collaborator; the relay only needs
//! a single "send code" seam. Production wires an SMTP or API-backed
//! implementation; tests and development use [`LogCodeSender`].

use tracing::info;

/// Sends a 6-digit verification code to an email address.
pub trait CodeSender: Send + Sync {
    /// Dispatch `code` to `email`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description when delivery fails.
    fn send_code(&self, email: &str, code: &str) -> std::result::Result<(), String>;
}

/// Development sender: logs instead of sending.
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send_code(&self, email: &str, _code: &str) -> std::result::Result<(), String> {
        info!(email, "Verification code issued");
        Ok(())
    }
}

/// Test sender that records every dispatched code.
#[derive(Default)]
pub struct CapturingCodeSender {
    codes: parking_lot::Mutex<Vec<(String, String)>>,
}

impl CapturingCodeSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent code sent to `email`.
    pub fn last_code_for(&self, email: &str) -> Option<String> {
        self.codes
            .lock()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| code.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.codes.lock().len()
    }
}

impl CodeSender for CapturingCodeSender {
    fn send_code(&self, email: &str, code: &str) -> std::result::Result<(), String> {
        self.codes
            .lock()
            .push((email.to_string(), code.to_string()));
        Ok(())
    }
}
