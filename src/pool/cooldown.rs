//! Cooldown policy: when an unhealthy key is benched, and for how long.

use std::time::Duration;

/// Exponential, capped backoff applied once a key reaches the failure threshold.
///
/// With threshold `t`, base `b` and cap `c`, the n-th consecutive failure
/// (n ≥ t) benches the key for `min(b · 2^(n − t), c)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    /// Consecutive failures before a key is benched.
    pub failure_threshold: u32,
    /// Length of the first cooldown.
    pub backoff_base: Duration,
    /// Upper bound on any cooldown.
    pub backoff_cap: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(600),
        }
    }
}

impl CooldownPolicy {
    /// Cooldown for a key with `consecutive_failures` failures in a row,
    /// or `None` if the threshold has not been reached.
    pub fn backoff(&self, consecutive_failures: u32) -> Option<Duration> {
        if consecutive_failures < self.failure_threshold.max(1) {
            return None;
        }
        let exponent = (consecutive_failures - self.failure_threshold.max(1)).min(31);
        let scaled = self
            .backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_cap);
        Some(scaled.min(self.backoff_cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CooldownPolicy {
        CooldownPolicy {
            failure_threshold: 2,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_below_threshold_no_cooldown() {
        assert_eq!(policy().backoff(0), None);
        assert_eq!(policy().backoff(1), None);
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy();
        assert_eq!(p.backoff(2), Some(Duration::from_secs(10)));
        assert_eq!(p.backoff(3), Some(Duration::from_secs(20)));
        assert_eq!(p.backoff(4), Some(Duration::from_secs(40)));
    }

    #[test]
    fn test_capped() {
        let p = policy();
        assert_eq!(p.backoff(5), Some(Duration::from_secs(60)));
        assert_eq!(p.backoff(1_000), Some(Duration::from_secs(60)));
    }
}
