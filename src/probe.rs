//! The refresh probe contract.
//!
//! A probe performs exactly one remote read and classifies it into a named
//! logical state. Probes never retry; repetition, cadence and stability are
//! the [`Waiter`](crate::waiter::Waiter)'s job.
//!
//! Probes are usually one of the ready-made types in [`probes`](crate::probes),
//! but any async closure can be lifted into a probe with [`probe_fn`]:
//!
//! ```
//! use hemmer_reconciler::probe::{probe_fn, ProbeResult};
//!
//! let mut calls = 0u32;
//! let probe = probe_fn(move || {
//!     calls += 1;
//!     let n = calls;
//!     async move {
//!         if n < 3 {
//!             ProbeResult::<u32>::absent("pending")
//!         } else {
//!             ProbeResult::observed(n, "ready")
//!         }
//!     }
//! });
//! # let _ = probe;
//! ```

use std::future::Future;

use async_trait::async_trait;

use crate::error::ProviderError;

/// One classified observation of remote state.
///
/// A probe either observed something (possibly nothing at all, in which case
/// the payload is `None`) and labelled it, or failed fatally. It never does
/// both.
#[derive(Debug)]
pub enum ProbeResult<T> {
    /// The read completed and was classified.
    Observed {
        /// The object read, if the remote returned one.
        payload: Option<T>,
        /// The logical state label.
        state: String,
    },
    /// The read failed in a way polling cannot recover from.
    Failed(ProviderError),
}

impl<T> ProbeResult<T> {
    /// An observation carrying the object that was read.
    pub fn observed(payload: T, state: impl Into<String>) -> Self {
        Self::Observed {
            payload: Some(payload),
            state: state.into(),
        }
    }

    /// An observation with nothing to carry (e.g. the object is gone).
    pub fn absent(state: impl Into<String>) -> Self {
        Self::Observed {
            payload: None,
            state: state.into(),
        }
    }

    /// A fatal failure.
    pub fn failed(err: ProviderError) -> Self {
        Self::Failed(err)
    }

    /// The state label, or `None` for a fatal failure.
    pub fn state(&self) -> Option<&str> {
        match self {
            Self::Observed { state, .. } => Some(state),
            Self::Failed(_) => None,
        }
    }

    /// Whether this result is a fatal failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A zero-argument remote read that classifies what it saw.
///
/// Implementations capture everything they need (client, identifier,
/// expected condition) at construction time.
#[async_trait]
pub trait Probe: Send {
    /// The object type produced by a successful read.
    type Payload: Send;

    /// Perform one read. Must not retry internally.
    async fn probe(&mut self) -> ProbeResult<Self::Payload>;
}

#[async_trait]
impl<P: Probe + ?Sized> Probe for &mut P {
    type Payload = P::Payload;

    async fn probe(&mut self) -> ProbeResult<Self::Payload> {
        (**self).probe().await
    }
}

#[async_trait]
impl<P: Probe + ?Sized> Probe for Box<P> {
    type Payload = P::Payload;

    async fn probe(&mut self) -> ProbeResult<Self::Payload> {
        (**self).probe().await
    }
}

/// A [`Probe`] backed by a closure returning a future. See [`probe_fn`].
pub struct ProbeFn<F> {
    f: F,
}

/// Lift an async closure into a [`Probe`].
pub fn probe_fn<F, Fut, T>(f: F) -> ProbeFn<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ProbeResult<T>> + Send,
    T: Send,
{
    ProbeFn { f }
}

#[async_trait]
impl<F, Fut, T> Probe for ProbeFn<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ProbeResult<T>> + Send,
    T: Send,
{
    type Payload = T;

    async fn probe(&mut self) -> ProbeResult<T> {
        (self.f)().await
    }
}

/// Classify a lookup that may legitimately come back empty.
///
/// `Ok(Some(_))` becomes `found`, `Ok(None)` and [`ProviderError::NotFound`]
/// both become `missing`, and every other error is fatal.
///
/// ```
/// use hemmer_reconciler::probe::{classify_lookup, ProbeResult};
/// use hemmer_reconciler::ProviderError;
///
/// let r: ProbeResult<()> = classify_lookup(Err(ProviderError::NotFound("x".into())), "present", "gone");
/// assert_eq!(r.state(), Some("gone"));
/// ```
pub fn classify_lookup<T>(
    lookup: Result<Option<T>, ProviderError>,
    found: &str,
    missing: &str,
) -> ProbeResult<T> {
    match lookup {
        Ok(Some(payload)) => ProbeResult::observed(payload, found),
        Ok(None) => ProbeResult::absent(missing),
        Err(err) if err.is_not_found() => ProbeResult::absent(missing),
        Err(err) => ProbeResult::failed(err),
    }
}

/// Whether `state` is one of `labels`.
pub(crate) fn contains_label(labels: &[String], state: &str) -> bool {
    labels.iter().any(|l| l == state)
}
