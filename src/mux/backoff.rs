//! Retry policy for broker connects.
//!
//! The policy is a plain value: the connection loop asks it for the delay
//! before each retry and stops when it runs out.

use std::time::Duration;

use serde::Deserialize;

/// Shape of the delay sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffSequence {
    /// base × 1, 1, 2, 3, 5, 8, …
    #[default]
    Fibonacci,
    /// base × 1, 2, 4, 8, …
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub sequence: BackoffSequence,
    pub base_interval: Duration,
    /// Upper bound for a single delay.
    pub max_interval: Duration,
    /// Retries after the first failed attempt; `0` means a single attempt.
    pub max_retries: u32,
    /// Deadline for each individual connect attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            sequence: BackoffSequence::Fibonacci,
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_secs(10),
            max_retries: 20,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = match self.sequence {
            BackoffSequence::Fibonacci => fibonacci(retry + 1),
            BackoffSequence::Exponential => 2u64.saturating_pow(retry),
        };
        let factor = u32::try_from(factor).unwrap_or(u32::MAX);
        self.base_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }

    /// Every delay the policy allows, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay(retry))
    }

    /// Total connect attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(sequence: BackoffSequence, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            sequence,
            base_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            max_retries,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_fibonacci_sequence() {
        let delays: Vec<u64> = policy(BackoffSequence::Fibonacci, 7)
            .delays()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 10, 20, 30, 50, 80, 130]);
    }

    #[test]
    fn test_exponential_sequence() {
        let delays: Vec<u64> = policy(BackoffSequence::Exponential, 5)
            .delays()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160]);
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy(BackoffSequence::Exponential, 64);
        assert_eq!(p.delay(20), Duration::from_secs(1));
        assert_eq!(p.delay(63), Duration::from_secs(1));
        let p = policy(BackoffSequence::Fibonacci, 200);
        assert_eq!(p.delay(150), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let p = policy(BackoffSequence::Fibonacci, 0);
        assert_eq!(p.delays().count(), 0);
        assert_eq!(p.max_attempts(), 1);
    }

    #[test]
    fn test_default_matches_service_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 20);
        assert_eq!(p.base_interval, Duration::from_millis(1));
        // 1, 1, 2, 3, … 6765 ms, well under the cap
        assert_eq!(p.delay(19), Duration::from_millis(6765));
    }
}
