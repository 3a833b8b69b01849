//! The stabilization driver.
//!
//! [`Waiter`] repeatedly invokes a [`Probe`] until it has reported a target
//! state `continuous_target_occurrence` times in a row, the deadline passes,
//! the probe fails fatally, or the cancellation token fires.
//!
//! Polls are strictly sequential. The inter-poll delay is a lower bound: a
//! slow probe stretches the spacing, it never overlaps with the next call.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use hemmer_reconciler::{StabilizationPolicy, Waiter};
//!
//! let policy = StabilizationPolicy::new(["404"], ["200"])
//!     .with_min_poll_interval(Duration::from_secs(15))
//!     .with_continuous_target_occurrence(10)
//!     .with_timeout(Duration::from_secs(30 * 60));
//!
//! let observation = Waiter::new(policy).wait(&mut probe).await?;
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::WaitError;
use crate::policy::{deadline_after, StabilizationPolicy};
use crate::probe::{contains_label, Probe, ProbeResult};

/// Lifecycle of one stabilization run.
///
/// Every run starts in `Polling` and ends in exactly one of the other states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Still probing.
    Polling,
    /// The target state was observed often enough.
    Succeeded,
    /// The deadline passed.
    TimedOut,
    /// The probe failed fatally, or the observations ruled out convergence.
    Failed,
    /// The caller cancelled the run.
    Cancelled,
}

impl RunState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Polling)
    }
}

/// The successful outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation<T> {
    /// Payload of the final probe result.
    pub payload: Option<T>,
    /// The target label the run converged on.
    pub state: String,
    /// Total number of probe invocations.
    pub attempts: u32,
    /// Wall-clock time from start to convergence.
    pub elapsed: Duration,
}

/// Drives a probe to convergence under a [`StabilizationPolicy`].
#[derive(Debug, Clone)]
pub struct Waiter {
    policy: StabilizationPolicy,
    cancel: CancellationToken,
}

impl Waiter {
    /// Create a waiter that can only end by convergence, timeout or failure.
    pub fn new(policy: StabilizationPolicy) -> Self {
        Self {
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token` between polls and while a probe is in flight.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The policy this waiter applies.
    pub fn policy(&self) -> &StabilizationPolicy {
        &self.policy
    }

    /// Run the probe until a terminal state is reached.
    ///
    /// A waiter can be reused; every call starts a fresh run.
    pub async fn wait<P: Probe>(&self, probe: &mut P) -> Result<Observation<P::Payload>, WaitError> {
        wait_for_state(probe, &self.policy, &self.cancel).await
    }
}

/// Transient bookkeeping for a single run.
struct StabilizationRun {
    started: Instant,
    deadline: Instant,
    attempts: u32,
    streak: u32,
    missing: u32,
    interval: Duration,
    last_state: Option<String>,
    state: RunState,
}

impl StabilizationRun {
    fn start(policy: &StabilizationPolicy) -> Self {
        Self {
            started: Instant::now(),
            deadline: deadline_after(policy.timeout),
            attempts: 0,
            streak: 0,
            missing: 0,
            interval: policy.min_poll_interval,
            last_state: None,
            state: RunState::Polling,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// The next sleep, clipped so the deadline is noticed on time.
    fn next_sleep(&mut self, policy: &StabilizationPolicy) -> Duration {
        let sleep = self.interval.min(self.remaining());
        self.interval = policy.next_interval(self.interval);
        sleep
    }

    fn timed_out(&mut self, policy: &StabilizationPolicy) -> WaitError {
        self.state = RunState::TimedOut;
        warn!(
            attempts = self.attempts,
            last_state = ?self.last_state,
            timeout = ?policy.timeout,
            "Gave up waiting for state to stabilize"
        );
        WaitError::Timeout {
            expected: policy.target.clone(),
            last_state: self.last_state.take(),
            timeout: policy.timeout,
            attempts: self.attempts,
        }
    }

    fn cancelled(&mut self, policy: &StabilizationPolicy) -> WaitError {
        self.state = RunState::Cancelled;
        warn!(
            attempts = self.attempts,
            last_state = ?self.last_state,
            "Wait cancelled"
        );
        WaitError::Cancelled {
            expected: policy.target.clone(),
            last_state: self.last_state.take(),
        }
    }

    fn failed(&mut self, err: WaitError) -> WaitError {
        self.state = RunState::Failed;
        error!(attempts = self.attempts, error = %err, "Wait failed");
        err
    }
}

/// What the driver does after classifying one probe result.
enum Step<T> {
    Continue,
    Done(Observation<T>),
}

fn record<T>(
    run: &mut StabilizationRun,
    policy: &StabilizationPolicy,
    result: ProbeResult<T>,
) -> Result<Step<T>, WaitError> {
    let (payload, state) = match result {
        ProbeResult::Observed { payload, state } => (payload, state),
        ProbeResult::Failed(source) => {
            return Err(run.failed(WaitError::Probe {
                source,
                attempts: run.attempts,
            }));
        },
    };

    if contains_label(&policy.target, &state) {
        run.missing = 0;
        run.streak += 1;
        debug!(
            attempt = run.attempts,
            state = %state,
            streak = run.streak,
            required = policy.continuous_target_occurrence,
            "Observed target state"
        );
        if run.streak >= policy.continuous_target_occurrence {
            run.state = RunState::Succeeded;
            let elapsed = run.started.elapsed();
            info!(
                attempts = run.attempts,
                state = %state,
                elapsed = ?elapsed,
                "State stabilized"
            );
            return Ok(Step::Done(Observation {
                payload,
                state,
                attempts: run.attempts,
                elapsed,
            }));
        }
        run.last_state = Some(state);
        return Ok(Step::Continue);
    }

    if run.streak > 0 {
        debug!(
            attempt = run.attempts,
            state = %state,
            streak = run.streak,
            "Target state regressed, resetting streak"
        );
    } else {
        debug!(attempt = run.attempts, state = %state, "Still pending");
    }
    run.streak = 0;

    if payload.is_none() {
        run.missing += 1;
        if let Some(checks) = policy.not_found_checks {
            if run.missing > checks {
                return Err(run.failed(WaitError::NotFound {
                    checks: run.missing,
                    last_state: state,
                }));
            }
        }
    } else {
        run.missing = 0;
    }

    if policy.strict && !contains_label(&policy.pending, &state) {
        return Err(run.failed(WaitError::UnexpectedState {
            state,
            expected: policy.target.clone(),
        }));
    }

    run.last_state = Some(state);
    Ok(Step::Continue)
}

/// Run `probe` under `policy` until convergence, timeout, failure or cancellation.
///
/// Returns the final observation on success. A fatal probe error aborts
/// immediately without another probe call.
#[instrument(
    skip_all,
    fields(
        target_states = ?policy.target,
        required = policy.continuous_target_occurrence,
        timeout = ?policy.timeout
    )
)]
pub async fn wait_for_state<P: Probe>(
    probe: &mut P,
    policy: &StabilizationPolicy,
    cancel: &CancellationToken,
) -> Result<Observation<P::Payload>, WaitError> {
    policy.validate()?;

    let mut run = StabilizationRun::start(policy);
    debug!(pending = ?policy.pending, "Waiting for state to stabilize");

    if !policy.delay.is_zero() {
        let delay = policy.delay.min(run.remaining());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(run.cancelled(policy)),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    loop {
        debug_assert_eq!(run.state, RunState::Polling);

        if cancel.is_cancelled() {
            return Err(run.cancelled(policy));
        }
        if Instant::now() >= run.deadline {
            return Err(run.timed_out(policy));
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(run.cancelled(policy)),
            _ = tokio::time::sleep_until(run.deadline) => return Err(run.timed_out(policy)),
            result = probe.probe() => result,
        };
        run.attempts += 1;

        if let Step::Done(observation) = record(&mut run, policy, result)? {
            return Ok(observation);
        }

        let sleep = run.next_sleep(policy);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(run.cancelled(policy)),
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::testing::{Scripted, ScriptedProbe};

    fn policy(required: u32, timeout: Duration) -> StabilizationPolicy {
        StabilizationPolicy::new(["pending"], ["target"])
            .with_min_poll_interval(Duration::from_millis(10))
            .with_continuous_target_occurrence(required)
            .with_timeout(timeout)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_target_needs_exactly_required_calls() {
        for required in [1, 2, 5, 10] {
            let mut probe = ScriptedProbe::repeat(Scripted::state("target"));
            let obs = Waiter::new(policy(required, Duration::from_secs(60)))
                .wait(&mut probe)
                .await
                .unwrap();
            assert_eq!(probe.calls(), required);
            assert_eq!(obs.attempts, required);
            assert_eq!(obs.state, "target");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_target() {
        let mut probe = ScriptedProbe::new(["pending", "target", "target", "target"]);
        let obs = Waiter::new(policy(3, Duration::from_secs(1)))
            .wait(&mut probe)
            .await
            .unwrap();
        assert_eq!(probe.calls(), 4);
        assert_eq!(obs.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regression_resets_streak() {
        let mut probe = ScriptedProbe::new(["target", "pending", "target", "target", "target"]);
        let obs = Waiter::new(policy(3, Duration::from_secs(1)))
            .wait(&mut probe)
            .await
            .unwrap();
        assert_eq!(probe.calls(), 5);
        assert_eq!(obs.attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_pending_then_streak() {
        for required in [1, 2, 5] {
            let mut script = vec![Scripted::state("pending")];
            script.extend((0..required).map(|_| Scripted::state("target")));
            let mut probe = ScriptedProbe::from_steps(script);
            Waiter::new(policy(required, Duration::from_secs(60)))
                .wait(&mut probe)
                .await
                .unwrap();
            assert_eq!(probe.calls(), 1 + required);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out() {
        let mut probe = ScriptedProbe::repeat(Scripted::state("pending"));
        let started = Instant::now();
        let err = Waiter::new(policy(1, Duration::from_millis(50)))
            .wait(&mut probe)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.last_state(), Some("pending"));
        assert!(started.elapsed() >= Duration::from_millis(50));

        // probes at 0, 10, 20, 30 and 40ms
        assert_eq!(probe.calls(), 5);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(probe.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_on_first_call() {
        let mut probe = ScriptedProbe::from_steps(vec![
            Scripted::fatal("access denied"),
            Scripted::state("target"),
        ]);
        let err = Waiter::new(policy(1, Duration::from_secs(1)))
            .wait(&mut probe)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Probe { attempts: 1, .. }));
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_after_pending() {
        let mut probe =
            ScriptedProbe::from_steps(vec![Scripted::state("pending"), Scripted::fatal("boom")]);
        let err = Waiter::new(policy(3, Duration::from_secs(1)))
            .wait(&mut probe)
            .await
            .unwrap_err();
        match err {
            WaitError::Probe { source, attempts } => {
                assert_eq!(attempts, 2);
                assert!(matches!(source, ProviderError::PermissionDenied(_)));
            },
            other => panic!("expected probe error, got {}", other),
        }
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_is_reusable() {
        let waiter = Waiter::new(policy(2, Duration::from_secs(1)));
        let mut probe = ScriptedProbe::repeat(Scripted::state("target"));

        waiter.wait(&mut probe).await.unwrap();
        waiter.wait(&mut probe).await.unwrap();
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_label_counts_as_pending() {
        let mut probe = ScriptedProbe::new(["target", "Updating", "target", "target"]);
        Waiter::new(policy(2, Duration::from_secs(1)))
            .wait(&mut probe)
            .await
            .unwrap();
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_rejects_unknown_label() {
        let mut probe = ScriptedProbe::new(["pending", "Updating"]);
        let err = Waiter::new(policy(1, Duration::from_secs(1)).strict())
            .wait(&mut probe)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::UnexpectedState { ref state, .. } if state == "Updating"));
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_checks() {
        let mut probe = ScriptedProbe::repeat(Scripted::absent("pending"));
        let err = Waiter::new(policy(1, Duration::from_secs(10)).with_not_found_checks(3))
            .wait(&mut probe)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::NotFound { checks: 4, .. }));
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_resets_not_found_counter() {
        let mut probe = ScriptedProbe::from_steps(vec![
            Scripted::absent("pending"),
            Scripted::absent("pending"),
            Scripted::state("pending"),
            Scripted::absent("pending"),
            Scripted::absent("pending"),
            Scripted::state("target"),
        ]);
        Waiter::new(policy(1, Duration::from_secs(10)).with_not_found_checks(2))
            .wait(&mut probe)
            .await
            .unwrap();
        assert_eq!(probe.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_polls() {
        let token = CancellationToken::new();
        let mut probe = ScriptedProbe::repeat(Scripted::state("pending"));
        let waiter = Waiter::new(policy(1, Duration::from_secs(60))).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            token.cancel();
        });

        let err = waiter.wait(&mut probe).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
        assert_eq!(err.last_state(), Some("pending"));
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_probe() {
        let token = CancellationToken::new();
        let mut probe = ScriptedProbe::repeat(Scripted::state("target"))
            .with_latency(Duration::from_secs(30));
        let waiter = Waiter::new(policy(1, Duration::from_secs(60))).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = waiter.wait(&mut probe).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(err.last_state(), None);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_probes() {
        let token = CancellationToken::new();
        token.cancel();
        let mut probe = ScriptedProbe::repeat(Scripted::state("target"));
        let err = Waiter::new(policy(1, Duration::from_secs(1)))
            .with_cancellation(token)
            .wait(&mut probe)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_slow_probe() {
        let mut probe = ScriptedProbe::repeat(Scripted::state("target"))
            .with_latency(Duration::from_secs(5));
        let err = Waiter::new(policy(1, Duration::from_secs(1)))
            .wait(&mut probe)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.last_state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let mut probe = ScriptedProbe::repeat(Scripted::state("target"));
        let started = Instant::now();
        let obs = Waiter::new(policy(1, Duration::from_secs(10)).with_delay(Duration::from_secs(2)))
            .wait(&mut probe)
            .await
            .unwrap();
        assert_eq!(obs.attempts, 1);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_initial_delay() {
        let token = CancellationToken::new();
        let mut probe = ScriptedProbe::repeat(Scripted::state("target"));
        let waiter = Waiter::new(policy(1, Duration::from_secs(60)).with_delay(Duration::from_secs(5)))
            .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = waiter.wait(&mut probe).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(err.last_state(), None);
        assert_eq!(probe.calls(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_still_converges() {
        let mut probe = ScriptedProbe::new(["pending", "target"]);
        let obs = Waiter::new(policy(1, Duration::MAX))
            .wait(&mut probe)
            .await
            .unwrap();
        assert_eq!(obs.attempts, 2);
        assert_eq!(obs.elapsed, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_spacing() {
        let mut probe = ScriptedProbe::new(["pending", "pending", "pending", "target"]);
        let started = Instant::now();
        let policy = StabilizationPolicy::new(["pending"], ["target"])
            .with_min_poll_interval(Duration::from_secs(1))
            .with_max_poll_interval(Duration::from_secs(3))
            .with_timeout(Duration::from_secs(60));
        Waiter::new(policy).wait(&mut probe).await.unwrap();
        // 1s + 2s + 3s between the four calls
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_policy_never_probes() {
        let mut probe = ScriptedProbe::repeat(Scripted::state("target"));
        let err = Waiter::new(StabilizationPolicy::default())
            .wait(&mut probe)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::InvalidPolicy(_)));
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn test_run_state_terminality() {
        assert!(!RunState::Polling.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn test_real_clock_scenario() {
        let mut probe = ScriptedProbe::new(["pending", "target", "target", "target"]);
        let obs = Waiter::new(policy(3, Duration::from_secs(1)))
            .wait(&mut probe)
            .await
            .unwrap();
        assert_eq!(obs.attempts, 4);
        assert!(obs.elapsed >= Duration::from_millis(30));
    }
}
