// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded retry with backoff.
//!
//! Network-touching actions can fail transiently, so the runner wraps them
//! in a small bounded-retry policy with exponential backoff. Nothing else is
//! ever retried automatically: the retry mechanism for ordinary steps is
//! re-running the whole manifest.

use std::{thread::sleep, time::Duration};

/// Bounded exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Construct policy with target attempt bound and backoff window.
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Default policy for network-dependent actions.
    pub fn network_default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }

    /// Upper bound on attempts, including the first one.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Backoff delay before the given retry attempt.
    ///
    /// Attempt 1 is the first retry. Delays double per attempt and are capped
    /// at the policy's maximum delay.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let shift = attempt.saturating_sub(1).min(31) as u32;
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(shift));

        if self.max_delay.is_zero() {
            raw
        } else {
            raw.min(self.max_delay)
        }
    }

    /// Run target operation under this policy.
    ///
    /// Invokes the operation up to the attempt bound, sleeping the backoff
    /// delay between attempts. The `on_retry` callback observes every failed
    /// attempt that will be retried, so the caller can surface it in the run
    /// log. The final error is returned unchanged once attempts run out.
    pub fn run<T, E>(
        &self,
        mut operation: impl FnMut() -> Result<T, E>,
        mut on_retry: impl FnMut(usize, Duration, &E),
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    on_retry(attempt, delay, &error);
                    sleep(delay);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case(1, Duration::from_millis(500); "first retry")]
    #[test_case(2, Duration::from_millis(1000); "second retry")]
    #[test_case(3, Duration::from_millis(2000); "third retry")]
    #[test_case(10, Duration::from_secs(10); "capped at max delay")]
    #[test]
    fn delay_doubles_until_capped(attempt: usize, expect: Duration) {
        let policy = RetryPolicy::network_default();
        assert_eq!(policy.delay_for_attempt(attempt), expect);
    }

    #[test]
    fn run_stops_after_first_success() {
        let policy = RetryPolicy::new(5, Duration::ZERO, Duration::ZERO);
        let mut calls = 0;
        let result: Result<i32, &str> = policy.run(
            || {
                calls += 1;
                if calls < 3 {
                    Err("transient")
                } else {
                    Ok(42)
                }
            },
            |_, _, _| {},
        );

        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn run_bounds_attempts_and_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        let mut calls = 0;
        let mut retries = Vec::new();
        let result: Result<(), String> = policy.run(
            || {
                calls += 1;
                Err(format!("attempt {calls}"))
            },
            |attempt, _, _| retries.push(attempt),
        );

        assert_eq!(result, Err("attempt 3".into()));
        assert_eq!(calls, 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[test]
    fn none_policy_runs_exactly_once() {
        let policy = RetryPolicy::none();
        let mut calls = 0;
        let result: Result<(), &str> = policy.run(
            || {
                calls += 1;
                Err("nope")
            },
            |_, _, _| panic!("no retry expected"),
        );

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
