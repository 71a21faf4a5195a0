use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default [`ReconnectionBackoffPolicy`] for a persistent venue connection.
pub const DEFAULT_RECONNECTION_POLICY: ReconnectionBackoffPolicy = ReconnectionBackoffPolicy {
    backoff_ms_initial: 125,
    backoff_multiplier: 2,
    backoff_ms_max: 60000,
};

/// Policy dictating how the exponential backoff scales between reconnection attempts.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
pub struct ReconnectionBackoffPolicy {
    pub backoff_ms_initial: u64,
    pub backoff_multiplier: u64,
    pub backoff_ms_max: u64,
}

impl Default for ReconnectionBackoffPolicy {
    fn default() -> Self {
        DEFAULT_RECONNECTION_POLICY
    }
}

/// Tracks the current backoff [`Duration`] of a reconnecting client.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReconnectionState {
    policy: ReconnectionBackoffPolicy,
    backoff_ms_current: u64,
}

impl From<ReconnectionBackoffPolicy> for ReconnectionState {
    fn from(policy: ReconnectionBackoffPolicy) -> Self {
        Self {
            policy,
            backoff_ms_current: policy.backoff_ms_initial,
        }
    }
}

impl ReconnectionState {
    /// Return the [`Duration`] to sleep before the next reconnection attempt, scaling the
    /// internal backoff for the attempt after that.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.backoff_ms_current);
        self.backoff_ms_current = std::cmp::min(
            self.backoff_ms_current * self.policy.backoff_multiplier,
            self.policy.backoff_ms_max,
        );
        delay
    }

    /// Reset the backoff after a successful reconnection.
    pub fn reset(&mut self) {
        self.backoff_ms_current = self.policy.backoff_ms_initial;
    }
}
