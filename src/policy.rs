//! Stabilization policies.
//!
//! A [`StabilizationPolicy`] tells the [`Waiter`](crate::waiter::Waiter)
//! which state labels mean "keep going" and which mean "done", how often to
//! poll, how many consecutive target observations count as converged, and
//! when to give up.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::WaitError;

/// Default lower bound between two probe invocations.
pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default overall deadline for a single run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Longest timeout honoured; anything above is treated as this.
///
/// Roughly 30 years, so `Duration::MAX` can stand in for "no timeout".
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `timeout` from now, capped at [`MAX_TIMEOUT`].
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_TIMEOUT)
}

/// Configuration for one run of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilizationPolicy {
    /// Labels that mean the change is still propagating.
    pub pending: Vec<String>,
    /// Labels that count towards convergence.
    pub target: Vec<String>,
    /// Lower bound on the spacing between probe invocations.
    pub min_poll_interval: Duration,
    /// When set, the spacing doubles after every poll up to this cap.
    pub max_poll_interval: Option<Duration>,
    /// Wait before the very first probe.
    pub delay: Duration,
    /// Consecutive target observations required before succeeding.
    pub continuous_target_occurrence: u32,
    /// Overall deadline, measured from the start of the run.
    pub timeout: Duration,
    /// Fail after this many consecutive non-target observations without payload.
    pub not_found_checks: Option<u32>,
    /// Fail on labels that are in neither `pending` nor `target`.
    pub strict: bool,
}

impl Default for StabilizationPolicy {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            target: Vec::new(),
            min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
            max_poll_interval: None,
            delay: Duration::ZERO,
            continuous_target_occurrence: 1,
            timeout: DEFAULT_TIMEOUT,
            not_found_checks: None,
            strict: false,
        }
    }
}

impl StabilizationPolicy {
    /// Create a policy for the given pending and target labels.
    ///
    /// ```
    /// use std::time::Duration;
    /// use hemmer_reconciler::StabilizationPolicy;
    ///
    /// let policy = StabilizationPolicy::new(["404"], ["200"])
    ///     .with_min_poll_interval(Duration::from_secs(15))
    ///     .with_continuous_target_occurrence(10)
    ///     .with_timeout(Duration::from_secs(30 * 60));
    /// assert!(policy.validate().is_ok());
    /// ```
    pub fn new<P, T>(pending: P, target: T) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the minimum inter-poll delay.
    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    /// Enable exponential backoff capped at `max`.
    pub fn with_max_poll_interval(mut self, max: Duration) -> Self {
        self.max_poll_interval = Some(max);
        self
    }

    /// Wait this long before the first probe.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the number of consecutive target observations required.
    pub fn with_continuous_target_occurrence(mut self, count: u32) -> Self {
        self.continuous_target_occurrence = count;
        self
    }

    /// Set the overall deadline as a duration from the start of the run.
    ///
    /// Values above [`MAX_TIMEOUT`] are capped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the overall deadline as an absolute instant.
    ///
    /// An instant in the past yields a zero timeout, so the run reports a
    /// timeout without probing.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.timeout = deadline.saturating_duration_since(Instant::now());
        self
    }

    /// Fail after `checks` consecutive payload-less, non-target observations.
    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = Some(checks);
        self
    }

    /// Treat labels outside both sets as an error instead of as pending.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Check that the policy can drive a run.
    pub fn validate(&self) -> Result<(), WaitError> {
        if self.target.is_empty() {
            return Err(WaitError::InvalidPolicy(
                "at least one target state is required".to_string(),
            ));
        }
        if self.continuous_target_occurrence == 0 {
            return Err(WaitError::InvalidPolicy(
                "continuous target occurrence must be at least 1".to_string(),
            ));
        }
        if let Some(overlap) = self.pending.iter().find(|p| self.target.contains(p)) {
            return Err(WaitError::InvalidPolicy(format!(
                "state '{}' is both pending and target",
                overlap
            )));
        }
        if let Some(max) = self.max_poll_interval {
            if max < self.min_poll_interval {
                return Err(WaitError::InvalidPolicy(format!(
                    "max poll interval {:?} is below min poll interval {:?}",
                    max, self.min_poll_interval
                )));
            }
        }
        Ok(())
    }

    /// The delay to use after a poll, given the delay used before it.
    pub(crate) fn next_interval(&self, current: Duration) -> Duration {
        match self.max_poll_interval {
            Some(max) => current.saturating_mul(2).clamp(self.min_poll_interval, max),
            None => self.min_poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = StabilizationPolicy::default();
        assert_eq!(policy.min_poll_interval, Duration::from_secs(10));
        assert_eq!(policy.continuous_target_occurrence, 1);
        assert_eq!(policy.delay, Duration::ZERO);
        assert!(policy.not_found_checks.is_none());
        assert!(!policy.strict);
    }

    #[test]
    fn test_builder() {
        let policy = StabilizationPolicy::new(["Unavailable"], ["Available"])
            .with_min_poll_interval(Duration::from_secs(10))
            .with_continuous_target_occurrence(2)
            .with_not_found_checks(5)
            .strict();
        assert_eq!(policy.pending, vec!["Unavailable".to_string()]);
        assert_eq!(policy.target, vec!["Available".to_string()]);
        assert_eq!(policy.continuous_target_occurrence, 2);
        assert_eq!(policy.not_found_checks, Some(5));
        assert!(policy.strict);
    }

    #[test]
    fn test_validate_rejects_empty_target() {
        let policy = StabilizationPolicy::new(["pending"], Vec::<String>::new());
        assert!(matches!(policy.validate(), Err(WaitError::InvalidPolicy(_))));
    }

    #[test]
    fn test_validate_rejects_zero_occurrence() {
        let policy = StabilizationPolicy::new(["a"], ["b"]).with_continuous_target_occurrence(0);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let policy = StabilizationPolicy::new(["a", "b"], ["b"]);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let policy = StabilizationPolicy::new(["a"], ["b"])
            .with_min_poll_interval(Duration::from_secs(10))
            .with_max_poll_interval(Duration::from_secs(5));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_fixed_interval() {
        let policy = StabilizationPolicy::new(["a"], ["b"])
            .with_min_poll_interval(Duration::from_millis(10));
        let next = policy.next_interval(Duration::from_millis(10));
        assert_eq!(next, Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = StabilizationPolicy::new(["a"], ["b"])
            .with_min_poll_interval(Duration::from_secs(1))
            .with_max_poll_interval(Duration::from_secs(5));

        let d1 = policy.next_interval(Duration::from_secs(1));
        let d2 = policy.next_interval(d1);
        let d3 = policy.next_interval(d2);
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(d3, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_is_capped() {
        let now = Instant::now();
        assert_eq!(deadline_after(Duration::MAX), now + MAX_TIMEOUT);
        assert_eq!(deadline_after(Duration::from_secs(5)), now + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_in_past_gives_zero_timeout() {
        let past = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        let policy = StabilizationPolicy::new(["a"], ["b"]).with_deadline(past);
        assert_eq!(policy.timeout, Duration::ZERO);
    }
}
