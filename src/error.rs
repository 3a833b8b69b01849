//! Error types for the Hemmer reconciler.
//!
//! Two layers of errors live here. [`ProviderError`] is what a provider's
//! CRUD handlers return to the host, and [`WaitError`] is the terminal
//! outcome of a single stabilization run. Resource operations translate the
//! latter into the former, attaching the resource type and identifier.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when implementing a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested resource was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal error occurred.
    #[error("SDK error: {0}")]
    Sdk(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Permission denied (authentication/authorization failure).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Service temporarily unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The remote system did not converge within the allotted time.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The operation was abandoned by the caller (e.g. provider shutdown).
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Operation failed due to current state (precondition not met).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Invalid request from client.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Validation(msg) => msg,
            Self::Sdk(msg) => msg,
            Self::Configuration(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::PermissionDenied(msg) => msg,
            Self::Unavailable(msg) => msg,
            Self::DeadlineExceeded(msg) => msg,
            Self::Cancelled(msg) => msg,
            Self::FailedPrecondition(msg) => msg,
            Self::InvalidRequest(msg) => msg,
        }
    }

    /// Whether this error means the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Prefix the message with caller context, keeping the variant.
    ///
    /// `Serialization` is the one exception: its source error cannot carry
    /// a prefix, so it becomes [`ProviderError::Sdk`] with the rendered error.
    ///
    /// ```
    /// use hemmer_reconciler::ProviderError;
    ///
    /// let err = ProviderError::PermissionDenied("403".to_string())
    ///     .with_context("deleting key_vault \"kv1\"");
    /// assert_eq!(err.message(), "deleting key_vault \"kv1\": 403");
    /// ```
    pub fn with_context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |msg: String| format!("{}: {}", context, msg);
        match self {
            Self::NotFound(msg) => Self::NotFound(wrap(msg)),
            Self::Validation(msg) => Self::Validation(wrap(msg)),
            Self::Sdk(msg) => Self::Sdk(wrap(msg)),
            Self::Configuration(msg) => Self::Configuration(wrap(msg)),
            Self::Serialization(err) => Self::Sdk(wrap(format!("serialization error: {}", err))),
            Self::PermissionDenied(msg) => Self::PermissionDenied(wrap(msg)),
            Self::Unavailable(msg) => Self::Unavailable(wrap(msg)),
            Self::DeadlineExceeded(msg) => Self::DeadlineExceeded(wrap(msg)),
            Self::Cancelled(msg) => Self::Cancelled(wrap(msg)),
            Self::FailedPrecondition(msg) => Self::FailedPrecondition(wrap(msg)),
            Self::InvalidRequest(msg) => Self::InvalidRequest(wrap(msg)),
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Sdk(msg) => tonic::Status::internal(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            ProviderError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            ProviderError::Unavailable(msg) => tonic::Status::unavailable(msg),
            ProviderError::DeadlineExceeded(msg) => tonic::Status::deadline_exceeded(msg),
            ProviderError::Cancelled(msg) => tonic::Status::cancelled(msg),
            ProviderError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
        }
    }
}

/// Terminal failure of a stabilization run.
///
/// `Timeout` and `Cancelled` are kept apart so callers can tell a slow
/// remote system from a caller that gave up.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The deadline passed before the target state was observed often enough.
    #[error(
        "timeout while waiting for state to become '{}' (last state: '{}', waited up to {:?})",
        .expected.join(", "),
        .last_state.as_deref().unwrap_or("no observation yet"),
        .timeout
    )]
    Timeout {
        /// Labels that would have counted towards convergence.
        expected: Vec<String>,
        /// The last label observed, if any probe completed.
        last_state: Option<String>,
        /// The configured deadline.
        timeout: Duration,
        /// Number of completed probe invocations.
        attempts: u32,
    },

    /// The cancellation token fired before the run converged.
    #[error(
        "cancelled while waiting for state to become '{}' (last state: '{}')",
        .expected.join(", "),
        .last_state.as_deref().unwrap_or("no observation yet")
    )]
    Cancelled {
        /// Labels that would have counted towards convergence.
        expected: Vec<String>,
        /// The last label observed, if any probe completed.
        last_state: Option<String>,
    },

    /// The probe reported a failure that polling cannot fix.
    #[error("probe failed after {attempts} attempt(s): {source}")]
    Probe {
        /// The underlying read failure.
        #[source]
        source: ProviderError,
        /// Number of probe invocations, including the failing one.
        attempts: u32,
    },

    /// The probe kept returning nothing at all.
    #[error("couldn't find resource ({checks} retries)")]
    NotFound {
        /// How many consecutive payload-less observations were seen.
        checks: u32,
        /// The last label observed.
        last_state: String,
    },

    /// Strict mode saw a label in neither the pending nor the target set.
    #[error("unexpected state '{state}', wanted target '{}'", .expected.join(", "))]
    UnexpectedState {
        /// The offending label.
        state: String,
        /// Labels that would have counted towards convergence.
        expected: Vec<String>,
    },

    /// The policy cannot drive a run (e.g. empty target set).
    #[error("invalid stabilization policy: {0}")]
    InvalidPolicy(String),
}

impl WaitError {
    /// The last observed state label carried by this error, if any.
    pub fn last_state(&self) -> Option<&str> {
        match self {
            Self::Timeout { last_state, .. } | Self::Cancelled { last_state, .. } => {
                last_state.as_deref()
            },
            Self::NotFound { last_state, .. } => Some(last_state),
            Self::UnexpectedState { state, .. } => Some(state),
            Self::Probe { .. } | Self::InvalidPolicy(_) => None,
        }
    }

    /// Whether the run ended because the deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the run ended because the caller cancelled it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::NotFound("resource-123".to_string());
        assert_eq!(format!("{}", err), "Resource not found: resource-123");

        let err = ProviderError::Cancelled("shutdown".to_string());
        assert_eq!(format!("{}", err), "Cancelled: shutdown");

        let err = ProviderError::DeadlineExceeded("slow".to_string());
        assert_eq!(format!("{}", err), "Deadline exceeded: slow");
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = ProviderError::NotFound("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = ProviderError::DeadlineExceeded("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = ProviderError::Cancelled("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Cancelled);

        let status: tonic::Status = ProviderError::Configuration("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = ProviderError::PermissionDenied("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn test_with_context_keeps_variant() {
        let err = ProviderError::Unavailable("503".to_string()).with_context("reading vault");
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert_eq!(err.message(), "reading vault: 503");
    }

    #[test]
    fn test_with_context_turns_serialization_into_sdk() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ProviderError::from(source).with_context("reading vault");
        assert!(matches!(err, ProviderError::Sdk(_)));
        assert!(err.message().starts_with("reading vault: serialization error: "));
    }

    #[test]
    fn test_timeout_message_includes_last_state() {
        let err = WaitError::Timeout {
            expected: vec!["200".to_string()],
            last_state: Some("404".to_string()),
            timeout: Duration::from_secs(60),
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "timeout while waiting for state to become '200' (last state: '404', waited up to 60s)"
        );
        assert_eq!(err.last_state(), Some("404"));
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_timeout_without_observation() {
        let err = WaitError::Timeout {
            expected: vec!["gone".to_string()],
            last_state: None,
            timeout: Duration::from_millis(50),
            attempts: 0,
        };
        assert!(err.to_string().contains("no observation yet"));
        assert_eq!(err.last_state(), None);
    }

    #[test]
    fn test_probe_error_source() {
        let err = WaitError::Probe {
            source: ProviderError::PermissionDenied("nope".to_string()),
            attempts: 2,
        };
        assert_eq!(
            err.to_string(),
            "probe failed after 2 attempt(s): Permission denied: nope"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
