//! The remote resource accessor boundary.
//!
//! Probes never talk HTTP themselves. They go through a [`ResourceAccessor`],
//! which the surrounding provider implements on top of its generated API
//! client. The accessor is shared read-only across concurrent operations, so
//! implementations must be `Send + Sync`.

use async_trait::async_trait;

use crate::error::ProviderError;

/// Read access to remote objects, as seen by probes.
///
/// # Example
///
/// ```ignore
/// use hemmer_reconciler::{async_trait, ProviderError, ResourceAccessor};
///
/// struct MetricAlerts { client: InsightsClient }
///
/// #[async_trait]
/// impl ResourceAccessor for MetricAlerts {
///     type Payload = MetricAlert;
///
///     async fn get(&self, id: &str) -> Result<Option<MetricAlert>, ProviderError> {
///         match self.client.get(id).await {
///             Ok(alert) => Ok(Some(alert)),
///             Err(e) if e.status() == 404 => Ok(None),
///             Err(e) => Err(ProviderError::Unavailable(e.to_string())),
///         }
///     }
///
///     fn status(&self, alert: &MetricAlert) -> Option<u16> {
///         Some(alert.status_code)
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceAccessor: Send + Sync + 'static {
    /// The object returned by a read.
    type Payload: Send + Sync + 'static;

    /// Read the object identified by `id`.
    ///
    /// `Ok(None)` means the object does not exist. Returning
    /// [`ProviderError::NotFound`] is treated the same way.
    async fn get(&self, id: &str) -> Result<Option<Self::Payload>, ProviderError>;

    /// An HTTP-style status code describing a read payload.
    ///
    /// Used by the creation probe; `None` means a plain successful read.
    fn status(&self, payload: &Self::Payload) -> Option<u16> {
        let _ = payload;
        None
    }

    /// Whether `name` is free to be claimed by a new object.
    async fn name_available(&self, name: &str) -> Result<bool, ProviderError> {
        Err(ProviderError::FailedPrecondition(format!(
            "name availability checks are not supported (name: {})",
            name
        )))
    }
}

/// Read `id`, folding [`ProviderError::NotFound`] into `Ok(None)`.
pub async fn lookup<A>(accessor: &A, id: &str) -> Result<Option<A::Payload>, ProviderError>
where
    A: ResourceAccessor + ?Sized,
{
    match accessor.get(id).await {
        Err(err) if err.is_not_found() => Ok(None),
        other => other,
    }
}
