//! Readiness polling budget.

use std::time::Duration;

/// Fixed polling schedule for the backend health endpoint.
///
/// Probes are numbered from 1. Every probe is bounded by `probe_timeout`, and
/// `interval` separates consecutive probes. No wait follows the final probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl ReadinessPolicy {
    /// Returns true if a failed probe numbered `attempt` leaves budget for another one.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound on wall-clock time spent polling before giving up.
    pub fn worst_case(&self) -> Duration {
        let probes = self.probe_timeout.saturating_mul(self.max_attempts);
        let pauses = self
            .interval
            .saturating_mul(self.max_attempts.saturating_sub(1));
        probes.saturating_add(pauses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_is_thirty_one_second_probes() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.max_attempts, 30);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.probe_timeout, Duration::from_secs(1));
    }

    #[test]
    fn has_next_stops_at_the_last_attempt() {
        let policy = ReadinessPolicy {
            max_attempts: 3,
            ..ReadinessPolicy::default()
        };
        assert!(policy.has_next(1));
        assert!(policy.has_next(2));
        assert!(!policy.has_next(3));
    }

    #[test]
    fn worst_case_skips_the_pause_after_the_final_probe() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.worst_case(), Duration::from_secs(30 + 29));
    }
}
