//! Hemmer Reconciler
//!
//! Eventual-consistency reconciliation for Hemmer providers. Many management
//! APIs acknowledge a write before every replica reflects it: a deleted
//! object keeps showing up for a while, a freshly created one answers 404, a
//! side effect lands minutes later. This crate lets a provider's CRUD
//! handlers block until the remote system has durably converged.
//!
//! # Overview
//!
//! - **Probes** ([`Probe`]): one remote read classified into a named state
//! - **Policies** ([`StabilizationPolicy`]): pending/target labels, cadence, streak, deadline
//! - **Driver** ([`Waiter`], [`wait_for_state`]): polls a probe until the target state
//!   has been seen enough times in a row, the deadline passes, the probe fails, or
//!   the run is cancelled
//! - **Accessor** ([`ResourceAccessor`]): the provider's read access to remote objects
//! - **Resource operations** ([`Reconciler`]): delete/create/appearance confirmations
//!   with resource-aware error messages
//! - **Configuration** ([`ReconcileConfig`]): timeouts and policy knobs from provider config
//! - **Logging**: `tracing` integration writing to stderr
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use hemmer_reconciler::{OperationKind, ProviderError, ReconcileConfig, Reconciler};
//!
//! struct KeyVaults {
//!     client: VaultClient,
//!     reconciler: Reconciler<VaultAccessor>,
//! }
//!
//! impl KeyVaults {
//!     async fn delete(&self, id: &str) -> Result<(), ProviderError> {
//!         let step = self.reconciler.begin(OperationKind::Delete);
//!         self.client.delete(id).await?;
//!         // Block until ten consecutive reads agree the vault is gone.
//!         self.reconciler.confirm_deleted(&step, "key_vault", id).await
//!     }
//! }
//! ```
//!
//! # Driving a probe directly
//!
//! ```
//! use std::time::Duration;
//! use hemmer_reconciler::{probe_fn, ProbeResult, StabilizationPolicy, Waiter};
//!
//! # tokio_test::block_on(async {
//! let mut reads = 0;
//! let mut probe = probe_fn(move || {
//!     reads += 1;
//!     let state = if reads == 1 { "404" } else { "200" };
//!     async move { ProbeResult::observed(reads, state) }
//! });
//!
//! let policy = StabilizationPolicy::new(["404"], ["200"])
//!     .with_min_poll_interval(Duration::from_millis(1))
//!     .with_continuous_target_occurrence(3)
//!     .with_timeout(Duration::from_secs(5));
//!
//! let observation = Waiter::new(policy).wait(&mut probe).await.unwrap();
//! assert_eq!(observation.attempts, 4);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accessor;
pub mod config;
pub mod error;
pub mod logging;
pub mod operation;
pub mod policy;
pub mod probe;
pub mod probes;
pub mod testing;
pub mod waiter;

// Re-export main types at crate root
pub use accessor::{lookup, ResourceAccessor};
pub use config::{OperationKind, OperationTimeouts, ReconcileConfig, StableObservations, WaitKind};
pub use error::{ProviderError, WaitError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use operation::{LifecycleStep, Reconciler};
pub use policy::StabilizationPolicy;
pub use probe::{classify_lookup, probe_fn, Probe, ProbeFn, ProbeResult};
pub use probes::{AppearanceProbe, CreationProbe, DeletionProbe, NameAvailabilityProbe};
pub use waiter::{wait_for_state, Observation, RunState, Waiter};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tokio_util::sync::CancellationToken;
pub use tracing;
