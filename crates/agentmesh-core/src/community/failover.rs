//! Sticky failover accounting
//!
//! Pure state machine, kept separate from the manager so the transition
//! rules are testable without any networking. Responses with status 0
//! (network error) or ≥ 500 count as failures; any success resets the
//! failure counter and latches `first_success_seen`. Once a community flips
//! to its failover relay it never flips back on its own.

/// Which relay of the pair is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    Primary,
    Failover,
}

/// Failover accounting for one community.
#[derive(Debug)]
pub struct FailoverState {
    pub active: RelayRole,
    pub consecutive_failures: u32,
    pub first_success_seen: bool,
    pub startup_failures: u32,
}

impl FailoverState {
    pub fn new() -> Self {
        Self {
            active: RelayRole::Primary,
            consecutive_failures: 0,
            first_success_seen: false,
            startup_failures: 0,
        }
    }

    /// Record a successful relay response.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.first_success_seen = true;
    }

    /// Record a transient failure. Returns `true` exactly when this failure
    /// flips the community to its failover relay.
    ///
    /// Before the first success, `startup_threshold` applies instead of
    /// `threshold`, permitting faster failover while a primary that was
    /// never reachable is still being probed.
    pub fn record_failure(
        &mut self,
        has_failover: bool,
        threshold: u32,
        startup_threshold: u32,
    ) -> bool {
        self.consecutive_failures += 1;
        if !self.first_success_seen {
            self.startup_failures += 1;
        }

        if self.active == RelayRole::Failover || !has_failover {
            return false;
        }

        let effective = if self.first_success_seen {
            threshold
        } else {
            startup_threshold.min(threshold)
        };

        if self.consecutive_failures >= effective {
            self.active = RelayRole::Failover;
            self.consecutive_failures = 0;
            true
        } else {
            false
        }
    }
}

impl Default for FailoverState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flips_after_threshold() {
        let mut state = FailoverState::new();
        state.record_success();
        assert!(!state.record_failure(true, 3, 1));
        assert!(!state.record_failure(true, 3, 1));
        assert!(state.record_failure(true, 3, 1));
        assert_eq!(state.active, RelayRole::Failover);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut state = FailoverState::new();
        state.record_success();
        state.record_failure(true, 3, 1);
        state.record_failure(true, 3, 1);
        state.record_success();
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.record_failure(true, 3, 1));
        assert_eq!(state.active, RelayRole::Primary);
    }

    #[test]
    fn test_sticky_after_flip() {
        let mut state = FailoverState::new();
        state.record_success();
        for _ in 0..3 {
            state.record_failure(true, 3, 1);
        }
        assert_eq!(state.active, RelayRole::Failover);

        // Primary recovering must not move us back, and further failures on
        // the failover relay must not emit another flip.
        state.record_success();
        assert_eq!(state.active, RelayRole::Failover);
        assert!(!state.record_failure(true, 3, 1));
        assert_eq!(state.active, RelayRole::Failover);
    }

    #[test]
    fn test_no_failover_configured() {
        let mut state = FailoverState::new();
        state.record_success();
        for _ in 0..10 {
            assert!(!state.record_failure(false, 3, 1));
        }
        assert_eq!(state.active, RelayRole::Primary);
    }

    #[test]
    fn test_startup_threshold_faster() {
        let mut state = FailoverState::new();
        // No success seen yet: the startup threshold of 1 applies.
        assert!(state.record_failure(true, 3, 1));
        assert_eq!(state.active, RelayRole::Failover);
        assert_eq!(state.startup_failures, 1);
    }

    #[test]
    fn test_startup_counter_stops_after_first_success() {
        let mut state = FailoverState::new();
        state.record_failure(true, 3, 2);
        state.record_success();
        state.record_failure(true, 3, 2);
        assert_eq!(state.startup_failures, 1);
    }
}
