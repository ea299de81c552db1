use std::time::Duration;

/// Bounded exponential backoff for transient store failures. Pure so the
/// schedule can be asserted without touching a transport.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before the next attempt, or `None` once the attempt
    /// ceiling is reached. `attempt` is the number of attempts already made
    /// (so the first failure passes 1).
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        Some(delay.min(self.max_delay))
    }
}
