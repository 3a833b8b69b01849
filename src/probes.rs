//! Ready-made probes for the common reconciliation waits.
//!
//! | Probe                    | Pending         | Target        |
//! |--------------------------|-----------------|---------------|
//! | [`DeletionProbe`]        | `present`       | `gone`        |
//! | [`CreationProbe`]        | `404`           | `200`         |
//! | [`AppearanceProbe`]      | `missing`       | `present`     |
//! | [`NameAvailabilityProbe`]| `Unavailable`   | `Available`   |
//!
//! Each probe has a matching `*_policy()` constructor carrying its labels
//! and default cadence. The defaults are starting points, not measured
//! values, and [`ReconcileConfig`](crate::config::ReconcileConfig) overrides them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::accessor::{lookup, ResourceAccessor};
use crate::policy::StabilizationPolicy;
use crate::probe::{classify_lookup, Probe, ProbeResult};

/// The object still exists.
pub const STATE_PRESENT: &str = "present";
/// The object no longer exists.
pub const STATE_GONE: &str = "gone";
/// The object (or a sub-item of it) has not shown up yet.
pub const STATE_MISSING: &str = "missing";
/// Read-after-write lag: the object was written but is not readable yet.
pub const STATE_NOT_FOUND: &str = "404";
/// The object is readable and healthy.
pub const STATE_OK: &str = "200";
/// The name is free.
pub const STATE_AVAILABLE: &str = "Available";
/// The name is still held.
pub const STATE_UNAVAILABLE: &str = "Unavailable";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Policy for [`DeletionProbe`]: ten consecutive `gone` reads.
pub fn deletion_policy() -> StabilizationPolicy {
    StabilizationPolicy::new([STATE_PRESENT], [STATE_GONE])
        .with_min_poll_interval(DEFAULT_INTERVAL)
        .with_continuous_target_occurrence(10)
}

/// Policy for [`CreationProbe`]: ten consecutive `200` reads, polled every 15s.
pub fn creation_policy() -> StabilizationPolicy {
    StabilizationPolicy::new([STATE_NOT_FOUND], [STATE_OK])
        .with_min_poll_interval(Duration::from_secs(15))
        .with_continuous_target_occurrence(10)
}

/// Policy for [`AppearanceProbe`]: two consecutive `present` reads.
pub fn appearance_policy() -> StabilizationPolicy {
    StabilizationPolicy::new([STATE_MISSING], [STATE_PRESENT])
        .with_min_poll_interval(DEFAULT_INTERVAL)
        .with_continuous_target_occurrence(2)
}

/// Policy for [`NameAvailabilityProbe`]: two consecutive `Available` reads.
pub fn name_release_policy() -> StabilizationPolicy {
    StabilizationPolicy::new([STATE_UNAVAILABLE], [STATE_AVAILABLE])
        .with_min_poll_interval(DEFAULT_INTERVAL)
        .with_continuous_target_occurrence(2)
}

/// Confirms that a deleted object has stopped being readable.
pub struct DeletionProbe<A: ResourceAccessor> {
    accessor: Arc<A>,
    id: String,
}

impl<A: ResourceAccessor> DeletionProbe<A> {
    /// Probe for the disappearance of `id`.
    pub fn new(accessor: Arc<A>, id: impl Into<String>) -> Self {
        Self {
            accessor,
            id: id.into(),
        }
    }
}

#[async_trait]
impl<A: ResourceAccessor> Probe for DeletionProbe<A> {
    type Payload = A::Payload;

    async fn probe(&mut self) -> ProbeResult<A::Payload> {
        debug!(id = %self.id, "Checking whether resource is gone");
        classify_lookup(
            lookup(self.accessor.as_ref(), &self.id).await,
            STATE_PRESENT,
            STATE_GONE,
        )
    }
}

type StateFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;

/// Confirms that a just-written object is consistently readable.
///
/// A not-found read is propagation lag and classifies as `404`. A successful
/// read is labelled by the accessor's [`status`](ResourceAccessor::status)
/// (defaulting to `200`), or by a custom classifier such as a
/// provisioning-state field.
pub struct CreationProbe<A: ResourceAccessor> {
    accessor: Arc<A>,
    id: String,
    classify: Option<StateFn<A::Payload>>,
}

impl<A: ResourceAccessor> CreationProbe<A> {
    /// Probe for `id` becoming readable.
    pub fn new(accessor: Arc<A>, id: impl Into<String>) -> Self {
        Self {
            accessor,
            id: id.into(),
            classify: None,
        }
    }

    /// Label successful reads with `classify` instead of the status code.
    ///
    /// ```ignore
    /// let probe = CreationProbe::new(accessor, id)
    ///     .with_state_fn(|server: &Server| server.provisioning_state.clone());
    /// ```
    pub fn with_state_fn<F>(mut self, classify: F) -> Self
    where
        F: Fn(&A::Payload) -> String + Send + Sync + 'static,
    {
        self.classify = Some(Box::new(classify));
        self
    }

    fn label(&self, payload: &A::Payload) -> String {
        match &self.classify {
            Some(classify) => classify(payload),
            None => self
                .accessor
                .status(payload)
                .map(|code| code.to_string())
                .unwrap_or_else(|| STATE_OK.to_string()),
        }
    }
}

#[async_trait]
impl<A: ResourceAccessor> Probe for CreationProbe<A> {
    type Payload = A::Payload;

    async fn probe(&mut self) -> ProbeResult<A::Payload> {
        debug!(id = %self.id, "Checking whether resource is readable");
        match lookup(self.accessor.as_ref(), &self.id).await {
            Ok(Some(payload)) => {
                let state = self.label(&payload);
                ProbeResult::observed(payload, state)
            },
            Ok(None) => ProbeResult::absent(STATE_NOT_FOUND),
            Err(err) => ProbeResult::failed(err),
        }
    }
}

/// Confirms that a named sub-item has appeared inside a parent object.
///
/// Used for side effects that surface asynchronously, e.g. a private
/// endpoint connection showing up on its target after the endpoint was
/// created.
pub struct AppearanceProbe<A, F>
where
    A: ResourceAccessor,
{
    accessor: Arc<A>,
    parent_id: String,
    child: String,
    children: F,
}

impl<A, F> AppearanceProbe<A, F>
where
    A: ResourceAccessor,
    F: Fn(&A::Payload) -> Vec<String> + Send + Sync,
{
    /// Probe `parent_id` for a sub-item named `child`, listed by `children`.
    pub fn new(
        accessor: Arc<A>,
        parent_id: impl Into<String>,
        child: impl Into<String>,
        children: F,
    ) -> Self {
        Self {
            accessor,
            parent_id: parent_id.into(),
            child: child.into(),
            children,
        }
    }
}

#[async_trait]
impl<A, F> Probe for AppearanceProbe<A, F>
where
    A: ResourceAccessor,
    F: Fn(&A::Payload) -> Vec<String> + Send + Sync,
{
    type Payload = A::Payload;

    async fn probe(&mut self) -> ProbeResult<A::Payload> {
        debug!(parent = %self.parent_id, child = %self.child, "Checking for sub-resource");
        let parent = match lookup(self.accessor.as_ref(), &self.parent_id).await {
            Ok(Some(parent)) => parent,
            Ok(None) => return ProbeResult::absent(STATE_MISSING),
            Err(err) => return ProbeResult::failed(err),
        };

        let found = (self.children)(&parent).iter().any(|name| *name == self.child);
        if found {
            ProbeResult::observed(parent, STATE_PRESENT)
        } else {
            ProbeResult::observed(parent, STATE_MISSING)
        }
    }
}

/// Confirms that a released name can be claimed again.
pub struct NameAvailabilityProbe<A: ResourceAccessor> {
    accessor: Arc<A>,
    name: String,
}

impl<A: ResourceAccessor> NameAvailabilityProbe<A> {
    /// Probe for `name` becoming available.
    pub fn new(accessor: Arc<A>, name: impl Into<String>) -> Self {
        Self {
            accessor,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<A: ResourceAccessor> Probe for NameAvailabilityProbe<A> {
    type Payload = bool;

    async fn probe(&mut self) -> ProbeResult<bool> {
        debug!(name = %self.name, "Checking name availability");
        match self.accessor.name_available(&self.name).await {
            Ok(true) => ProbeResult::observed(true, STATE_AVAILABLE),
            Ok(false) => ProbeResult::observed(false, STATE_UNAVAILABLE),
            Err(err) => ProbeResult::failed(err),
        }
    }
}
