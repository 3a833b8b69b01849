//! Resource operations: binding probes and policies to lifecycle steps.
//!
//! A [`Reconciler`] owns the shared accessor, the reconciliation settings and
//! the provider-wide shutdown token. Each CRUD handler starts a
//! [`LifecycleStep`] before its mutating call, so the configured timeout
//! covers the mutation and the wait that follows it.
//!
//! # Example
//!
//! ```ignore
//! async fn delete(&self, id: &str) -> Result<(), ProviderError> {
//!     let step = self.reconciler.begin(OperationKind::Delete);
//!     self.client.delete(id).await?;
//!     self.reconciler.confirm_deleted(&step, "monitor_diagnostic_setting", id).await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::accessor::ResourceAccessor;
use crate::config::{OperationKind, ReconcileConfig, WaitKind};
use crate::error::{ProviderError, WaitError};
use crate::policy::deadline_after;
use crate::probe::Probe;
use crate::probes::{AppearanceProbe, CreationProbe, DeletionProbe, NameAvailabilityProbe};
use crate::waiter::{wait_for_state, Observation};

/// One in-progress lifecycle step (create, update, delete...).
///
/// Carries the step's deadline and a cancellation token derived from the
/// reconciler's shutdown token.
#[derive(Debug, Clone)]
pub struct LifecycleStep {
    kind: OperationKind,
    deadline: Instant,
    token: CancellationToken,
}

impl LifecycleStep {
    /// The lifecycle step this belongs to.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Time left before the step's deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Token that fires when the provider shuts down or the step is abandoned.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Abandon the step; any wait running under it ends as cancelled.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Binds probes to resources and runs them under configured policies.
pub struct Reconciler<A: ResourceAccessor> {
    accessor: Arc<A>,
    config: ReconcileConfig,
    shutdown: CancellationToken,
}

impl<A: ResourceAccessor> Reconciler<A> {
    /// Create a reconciler over a shared accessor.
    pub fn new(accessor: Arc<A>, config: ReconcileConfig) -> Self {
        Self {
            accessor,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie all waits to an externally owned shutdown token.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// The shared accessor.
    pub fn accessor(&self) -> &Arc<A> {
        &self.accessor
    }

    /// The active settings.
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Cancel every wait started by this reconciler.
    pub fn shutdown(&self) {
        info!("Cancelling in-flight reconciliation waits");
        self.shutdown.cancel();
    }

    /// Start a lifecycle step; its deadline is the configured timeout from now.
    pub fn begin(&self, kind: OperationKind) -> LifecycleStep {
        LifecycleStep {
            kind,
            deadline: deadline_after(self.config.timeout(kind)),
            token: self.shutdown.child_token(),
        }
    }

    /// Wait until `id` is consistently unreadable after a delete.
    #[instrument(skip(self, step), fields(step = ?step.kind()))]
    pub async fn confirm_deleted(
        &self,
        step: &LifecycleStep,
        resource_type: &str,
        id: &str,
    ) -> Result<(), ProviderError> {
        let mut probe = DeletionProbe::new(Arc::clone(&self.accessor), id);
        self.run(step, WaitKind::Deletion, &mut probe)
            .await
            .map_err(|e| describe(e, resource_type, id, "be deleted"))?;
        Ok(())
    }

    /// Wait until `id` is consistently readable after a create or update.
    ///
    /// Returns the last read, ready to be flattened into state.
    #[instrument(skip(self, step), fields(step = ?step.kind()))]
    pub async fn confirm_created(
        &self,
        step: &LifecycleStep,
        resource_type: &str,
        id: &str,
    ) -> Result<A::Payload, ProviderError> {
        let probe = CreationProbe::new(Arc::clone(&self.accessor), id);
        self.confirm_readable(step, resource_type, id, probe).await
    }

    /// Like [`confirm_created`](Self::confirm_created) with a custom state classifier,
    /// for resources that report readiness through a provisioning-state field.
    #[instrument(skip(self, step, classify), fields(step = ?step.kind()))]
    pub async fn confirm_provisioned<F>(
        &self,
        step: &LifecycleStep,
        resource_type: &str,
        id: &str,
        pending: &[&str],
        target: &[&str],
        classify: F,
    ) -> Result<A::Payload, ProviderError>
    where
        F: Fn(&A::Payload) -> String + Send + Sync + 'static,
    {
        let mut probe = CreationProbe::new(Arc::clone(&self.accessor), id).with_state_fn(classify);
        let mut policy = self.config.policy(WaitKind::Creation, step.remaining());
        policy.pending = pending.iter().map(|s| s.to_string()).collect();
        policy.target = target.iter().map(|s| s.to_string()).collect();

        debug!(resource_type, id, target_states = ?target, "Waiting for provisioning to settle");
        let observation = wait_for_state(&mut probe, &policy, step.token())
            .await
            .map_err(|e| describe(e, resource_type, id, "finish provisioning"))?;
        payload_or_error(observation, resource_type, id)
    }

    /// Wait until a sub-item named `child` appears inside `parent_id`.
    ///
    /// `children` lists the sub-item names of a parent read.
    #[instrument(skip(self, step, children), fields(step = ?step.kind()))]
    pub async fn confirm_appeared<F>(
        &self,
        step: &LifecycleStep,
        resource_type: &str,
        parent_id: &str,
        child: &str,
        children: F,
    ) -> Result<A::Payload, ProviderError>
    where
        F: Fn(&A::Payload) -> Vec<String> + Send + Sync,
    {
        let mut probe = AppearanceProbe::new(Arc::clone(&self.accessor), parent_id, child, children);
        let target = format!("{}/{}", parent_id, child);
        let observation = self
            .run(step, WaitKind::Appearance, &mut probe)
            .await
            .map_err(|e| describe(e, resource_type, &target, "appear"))?;
        payload_or_error(observation, resource_type, &target)
    }

    /// Wait until `name` can be claimed again after its owner was deleted.
    #[instrument(skip(self, step), fields(step = ?step.kind()))]
    pub async fn confirm_name_released(
        &self,
        step: &LifecycleStep,
        resource_type: &str,
        name: &str,
    ) -> Result<(), ProviderError> {
        let mut probe = NameAvailabilityProbe::new(Arc::clone(&self.accessor), name);
        self.run(step, WaitKind::NameRelease, &mut probe)
            .await
            .map_err(|e| describe(e, resource_type, name, "release its name"))?;
        Ok(())
    }

    async fn confirm_readable(
        &self,
        step: &LifecycleStep,
        resource_type: &str,
        id: &str,
        mut probe: CreationProbe<A>,
    ) -> Result<A::Payload, ProviderError> {
        let goal = match step.kind() {
            OperationKind::Update => "finish updating",
            _ => "finish creating",
        };
        let observation = self
            .run(step, WaitKind::Creation, &mut probe)
            .await
            .map_err(|e| describe(e, resource_type, id, goal))?;
        payload_or_error(observation, resource_type, id)
    }

    async fn run<P: Probe>(
        &self,
        step: &LifecycleStep,
        kind: WaitKind,
        probe: &mut P,
    ) -> Result<Observation<P::Payload>, WaitError> {
        let policy = self.config.policy(kind, step.remaining());
        debug!(?kind, remaining = ?policy.timeout, "Starting wait");
        wait_for_state(probe, &policy, step.token()).await
    }
}

fn payload_or_error<T>(
    observation: Observation<T>,
    resource_type: &str,
    id: &str,
) -> Result<T, ProviderError> {
    observation.payload.ok_or_else(|| {
        ProviderError::Sdk(format!(
            "{} {:?} converged to '{}' without returning a body",
            resource_type, id, observation.state
        ))
    })
}

/// Turn a driver failure into a user-facing error naming the resource.
fn describe(err: WaitError, resource_type: &str, id: &str, goal: &str) -> ProviderError {
    let subject = format!("waiting for {} {:?} to {}", resource_type, id, goal);
    match err {
        WaitError::Timeout {
            ref expected,
            ref last_state,
            timeout,
            attempts,
        } => ProviderError::DeadlineExceeded(format!(
            "{}: waited up to {:?} for state '{}', but observed '{}' after {} read(s); \
             the remote API has not caught up yet",
            subject,
            timeout,
            expected.join(", "),
            last_state.as_deref().unwrap_or("no observation yet"),
            attempts
        )),
        WaitError::Cancelled { .. } => ProviderError::Cancelled(format!("{}: {}", subject, err)),
        WaitError::Probe { source, .. } => source.with_context(subject),
        WaitError::NotFound { .. } => ProviderError::NotFound(format!("{}: {}", subject, err)),
        WaitError::UnexpectedState { .. } => {
            ProviderError::FailedPrecondition(format!("{}: {}", subject, err))
        },
        WaitError::InvalidPolicy(_) => ProviderError::Configuration(format!("{}: {}", subject, err)),
    }
}
