use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Reconnect schedule for a push session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// `None` retries forever at the capped delay.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }
}

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.policy.max_attempts {
            if self.attempt >= max_attempts {
                return None;
            }
        }
        let factor = 2u32.saturating_pow(self.attempt);
        let delay = self
            .policy
            .base
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
