//! Testing utilities for probes and resource operations.
//!
//! This module provides test doubles that let provider authors exercise
//! their reconciliation logic without a live management API.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_reconciler::testing::{InMemoryAccessor, Lookup};
//! use serde_json::json;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_delete_waits_for_propagation() {
//!     let accessor = InMemoryAccessor::new().with_responses("kv1", vec![
//!         Lookup::Found(json!({"id": "kv1"})),
//!         Lookup::Missing,
//!     ]);
//!     let reconciler = Reconciler::new(Arc::new(accessor), ReconcileConfig::default());
//!     let step = reconciler.begin(OperationKind::Delete);
//!     reconciler.confirm_deleted(&step, "key_vault", "kv1").await.unwrap();
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::accessor::ResourceAccessor;
use crate::error::ProviderError;
use crate::probe::{Probe, ProbeResult};

/// One step of a [`ScriptedProbe`] script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Report this state with the call number as payload.
    State(String),
    /// Report this state without a payload.
    Absent(String),
    /// Fail with [`ProviderError::PermissionDenied`] carrying this message.
    Fatal(String),
}

impl Scripted {
    /// A state observation with payload.
    pub fn state(label: impl Into<String>) -> Self {
        Self::State(label.into())
    }

    /// A state observation without payload.
    pub fn absent(label: impl Into<String>) -> Self {
        Self::Absent(label.into())
    }

    /// A fatal failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// A probe that replays a fixed script and counts its invocations.
///
/// Once the script runs out, the last step repeats forever. The payload of
/// every observation is the 1-based call number.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    steps: Vec<Scripted>,
    calls: u32,
    latency: Duration,
}

impl ScriptedProbe {
    /// Replay a sequence of state labels.
    pub fn new<I>(states: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::from_steps(states.into_iter().map(Scripted::state).collect())
    }

    /// Replay arbitrary steps.
    ///
    /// # Panics
    ///
    /// Panics if `steps` is empty.
    pub fn from_steps(steps: Vec<Scripted>) -> Self {
        assert!(!steps.is_empty(), "a scripted probe needs at least one step");
        Self {
            steps,
            calls: 0,
            latency: Duration::ZERO,
        }
    }

    /// Return the same step on every call.
    pub fn repeat(step: Scripted) -> Self {
        Self::from_steps(vec![step])
    }

    /// Make every call take `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// How many times the probe has been invoked.
    pub fn calls(&self) -> u32 {
        self.calls
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    type Payload = u32;

    async fn probe(&mut self) -> ProbeResult<u32> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let index = (self.calls as usize).min(self.steps.len() - 1);
        self.calls += 1;
        match &self.steps[index] {
            Scripted::State(label) => ProbeResult::observed(self.calls, label.clone()),
            Scripted::Absent(label) => ProbeResult::absent(label.clone()),
            Scripted::Fatal(msg) => ProbeResult::failed(ProviderError::PermissionDenied(msg.clone())),
        }
    }
}

/// One scripted answer of an [`InMemoryAccessor`] read.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The object exists with this body.
    Found(Value),
    /// The object does not exist (`Ok(None)`).
    Missing,
    /// The read fails with [`ProviderError::NotFound`].
    NotFoundError,
    /// The read fails with [`ProviderError::PermissionDenied`].
    Denied(String),
}

#[derive(Debug)]
struct Script<T> {
    responses: VecDeque<T>,
    last: Option<T>,
    reads: u32,
}

impl<T: Clone> Script<T> {
    fn next(&mut self) -> Option<T> {
        self.reads += 1;
        if let Some(next) = self.responses.pop_front() {
            self.last = Some(next);
        }
        self.last.clone()
    }
}

/// A [`ResourceAccessor`] serving scripted responses per identifier.
///
/// Each identifier replays its responses in order and then repeats the
/// last one. Unknown identifiers read as missing. Payloads are JSON objects;
/// a numeric `status` field is reported through
/// [`ResourceAccessor::status`].
#[derive(Debug, Default)]
pub struct InMemoryAccessor {
    objects: Mutex<HashMap<String, Script<Lookup>>>,
    names: Mutex<HashMap<String, Script<bool>>>,
}

impl InMemoryAccessor {
    /// Create an accessor with no objects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the reads of `id`.
    pub fn with_responses(self, id: impl Into<String>, responses: Vec<Lookup>) -> Self {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.into(),
                Script {
                    responses: responses.into(),
                    last: None,
                    reads: 0,
                },
            );
        self
    }

    /// Script the availability answers for `name`.
    pub fn with_name_availability(self, name: impl Into<String>, answers: Vec<bool>) -> Self {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name.into(),
                Script {
                    responses: answers.into(),
                    last: None,
                    reads: 0,
                },
            );
        self
    }

    /// How many times `id` has been read.
    pub fn reads(&self, id: &str) -> u32 {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|s| s.reads)
            .unwrap_or(0)
    }

    /// How many times availability of `name` has been checked.
    pub fn name_checks(&self, name: &str) -> u32 {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|s| s.reads)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResourceAccessor for InMemoryAccessor {
    type Payload = Value;

    async fn get(&self, id: &str) -> Result<Option<Value>, ProviderError> {
        let next = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
            .and_then(Script::next);

        match next {
            Some(Lookup::Found(body)) => Ok(Some(body)),
            Some(Lookup::Missing) | None => Ok(None),
            Some(Lookup::NotFoundError) => Err(ProviderError::NotFound(id.to_string())),
            Some(Lookup::Denied(msg)) => Err(ProviderError::PermissionDenied(msg)),
        }
    }

    fn status(&self, payload: &Value) -> Option<u16> {
        payload
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
    }

    async fn name_available(&self, name: &str) -> Result<bool, ProviderError> {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(name)
            .and_then(Script::next)
            .ok_or_else(|| ProviderError::NotFound(format!("no availability scripted for {}", name)))
    }
}
