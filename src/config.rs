//! Reconciliation settings read from provider configuration.
//!
//! The provider host hands `configure` a JSON object. The reconciliation
//! knobs live under it and every field is optional:
//!
//! ```json
//! {
//!   "timeouts": { "create": 1800, "read": 300, "update": 1800, "delete": 1800 },
//!   "min_poll_interval_secs": 10,
//!   "max_poll_interval_secs": 60,
//!   "stable_observations": { "delete": 10, "create": 10, "appearance": 2, "name_release": 2 },
//!   "not_found_checks": 20
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::policy::StabilizationPolicy;
use crate::probes;

/// Which lifecycle step an operation belongs to. Selects the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Creating a new resource.
    Create,
    /// Refreshing a resource.
    Read,
    /// Updating an existing resource in place.
    Update,
    /// Destroying a resource.
    Delete,
}

/// Which kind of convergence a wait is confirming. Selects labels and streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// A deleted object stops being readable.
    Deletion,
    /// A written object becomes consistently readable.
    Creation,
    /// A sub-item shows up inside a parent.
    Appearance,
    /// A released name becomes claimable.
    NameRelease,
}

/// Per-operation timeouts, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationTimeouts {
    /// Create timeout.
    pub create: u64,
    /// Read timeout.
    pub read: u64,
    /// Update timeout.
    pub update: u64,
    /// Delete timeout.
    pub delete: u64,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            create: 30 * 60,
            read: 5 * 60,
            update: 30 * 60,
            delete: 30 * 60,
        }
    }
}

impl OperationTimeouts {
    /// The timeout for `kind`.
    pub fn get(&self, kind: OperationKind) -> Duration {
        let secs = match kind {
            OperationKind::Create => self.create,
            OperationKind::Read => self.read,
            OperationKind::Update => self.update,
            OperationKind::Delete => self.delete,
        };
        Duration::from_secs(secs)
    }
}

/// Consecutive target observations required per wait kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StableObservations {
    /// Deletion confirmation.
    pub delete: u32,
    /// Creation confirmation.
    pub create: u32,
    /// Appearance confirmation.
    pub appearance: u32,
    /// Name release confirmation.
    pub name_release: u32,
}

impl Default for StableObservations {
    fn default() -> Self {
        Self {
            delete: 10,
            create: 10,
            appearance: 2,
            name_release: 2,
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Upper bound for each lifecycle step, polling included.
    pub timeouts: OperationTimeouts,
    /// Lower bound between probe invocations.
    pub min_poll_interval_secs: u64,
    /// Enables exponential backoff up to this many seconds.
    pub max_poll_interval_secs: Option<u64>,
    /// Streak lengths per wait kind.
    pub stable_observations: StableObservations,
    /// Give up on appearance waits after this many reads of a missing parent.
    ///
    /// Unset, it is derived from the wait's timeout and poll interval, so a
    /// missing parent keeps counting as pending for the whole timeout.
    pub not_found_checks: Option<u32>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            timeouts: OperationTimeouts::default(),
            min_poll_interval_secs: 10,
            max_poll_interval_secs: None,
            stable_observations: StableObservations::default(),
            not_found_checks: None,
        }
    }
}

impl ReconcileConfig {
    /// Parse and validate settings from provider configuration.
    ///
    /// `null` yields the defaults.
    ///
    /// ```
    /// use hemmer_reconciler::ReconcileConfig;
    /// use serde_json::json;
    ///
    /// let config = ReconcileConfig::from_value(json!({
    ///     "timeouts": { "delete": 600 },
    ///     "stable_observations": { "delete": 5 }
    /// })).unwrap();
    /// assert_eq!(config.timeouts.delete, 600);
    /// assert_eq!(config.timeouts.create, 1800);
    /// assert_eq!(config.stable_observations.delete, 5);
    /// ```
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProviderError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_value(value)
            .map_err(|e| ProviderError::Configuration(format!("invalid reconcile settings: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every wait fail or spin.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.min_poll_interval_secs == 0 {
            return Err(ProviderError::Configuration(
                "min_poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(max) = self.max_poll_interval_secs {
            if max < self.min_poll_interval_secs {
                return Err(ProviderError::Configuration(format!(
                    "max_poll_interval_secs ({}) must not be below min_poll_interval_secs ({})",
                    max, self.min_poll_interval_secs
                )));
            }
        }

        let counts = [
            ("delete", self.stable_observations.delete),
            ("create", self.stable_observations.create),
            ("appearance", self.stable_observations.appearance),
            ("name_release", self.stable_observations.name_release),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, n)| *n == 0) {
            return Err(ProviderError::Configuration(format!(
                "stable_observations.{} must be at least 1",
                name
            )));
        }

        let timeouts = [
            ("create", self.timeouts.create),
            ("read", self.timeouts.read),
            ("update", self.timeouts.update),
            ("delete", self.timeouts.delete),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| *t == 0) {
            return Err(ProviderError::Configuration(format!(
                "timeouts.{} must be greater than zero",
                name
            )));
        }

        Ok(())
    }

    /// The configured timeout for a lifecycle step.
    pub fn timeout(&self, kind: OperationKind) -> Duration {
        self.timeouts.get(kind)
    }

    /// Build the policy for a wait of `kind` bounded by `timeout`.
    pub fn policy(&self, kind: WaitKind, timeout: Duration) -> StabilizationPolicy {
        let (base, required) = match kind {
            WaitKind::Deletion => (probes::deletion_policy(), self.stable_observations.delete),
            WaitKind::Creation => (probes::creation_policy(), self.stable_observations.create),
            WaitKind::Appearance => (
                probes::appearance_policy(),
                self.stable_observations.appearance,
            ),
            WaitKind::NameRelease => (
                probes::name_release_policy(),
                self.stable_observations.name_release,
            ),
        };

        let mut policy = base
            .with_min_poll_interval(Duration::from_secs(self.min_poll_interval_secs))
            .with_continuous_target_occurrence(required)
            .with_timeout(timeout);
        if let Some(max) = self.max_poll_interval_secs {
            policy = policy.with_max_poll_interval(Duration::from_secs(max));
        }
        if kind == WaitKind::Appearance {
            let checks = self
                .not_found_checks
                .unwrap_or_else(|| self.derived_not_found_checks(timeout));
            policy = policy.with_not_found_checks(checks);
        }
        policy
    }

    /// How many polls at the minimum interval fit into `timeout`.
    fn derived_not_found_checks(&self, timeout: Duration) -> u32 {
        let polls = timeout.as_secs() / self.min_poll_interval_secs.max(1);
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }
}
