//! Error types surfaced to callers of the governance layer

use crate::models::ResourceRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why an admission request could not be satisfied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum RejectReason {
    /// Waited for the full timeout without capacity freeing up
    TimedOut,
    /// Amounts were out of range
    InvalidRequest(String),
    /// Another active or queued request already uses this operation ID
    DuplicateOperation,
    /// The request alone exceeds a configured limit and can never be admitted
    ExceedsLimits(String),
    /// The governor is shutting down
    ShuttingDown,
}

impl RejectReason {
    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::TimedOut => "timed_out",
            RejectReason::InvalidRequest(_) => "invalid_request",
            RejectReason::DuplicateOperation => "duplicate_operation",
            RejectReason::ExceedsLimits(_) => "exceeds_limits",
            RejectReason::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TimedOut => f.write_str("timed out waiting for resources"),
            RejectReason::InvalidRequest(detail) => write!(f, "invalid request: {}", detail),
            RejectReason::DuplicateOperation => {
                f.write_str("operation id is already reserved or queued")
            }
            RejectReason::ExceedsLimits(detail) => write!(f, "exceeds limits: {}", detail),
            RejectReason::ShuttingDown => f.write_str("governor is shutting down"),
        }
    }
}

/// Admission timed out or was rejected
#[derive(Debug, Clone, Error)]
#[error("resources unavailable for operation '{}': {reason}", request.operation_id)]
pub struct ResourceUnavailableError {
    pub request: ResourceRequest,
    pub reason: RejectReason,
}

impl ResourceUnavailableError {
    pub fn new(request: ResourceRequest, reason: RejectReason) -> Self {
        Self { request, reason }
    }

    pub fn is_timeout(&self) -> bool {
        self.reason == RejectReason::TimedOut
    }
}

/// Closed set of failure kinds a fallback strategy can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unavailable,
    Overloaded,
    RateLimited,
    CircuitOpen,
    InvalidInput,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Overloaded => "overloaded",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Failure value returned by a single fallback strategy
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct StrategyError {
    pub kind: FailureKind,
    pub message: String,
}

impl StrategyError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

/// One failed attempt inside a fallback chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub strategy: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Every strategy in a fallback chain failed
#[derive(Debug, Clone, PartialEq, Error)]
#[error("all {} fallback strategies failed: {}", attempts.len(), summarize(attempts))]
pub struct ServiceUnavailableError {
    pub attempts: Vec<AttemptFailure>,
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({}: {})", a.strategy, a.kind, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a fallback chain that did not produce a value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FallbackError {
    /// A strategy failed with a kind it does not absorb
    #[error("strategy '{strategy}' failed with a non-recoverable error: {error}")]
    Propagated {
        strategy: String,
        error: StrategyError,
    },
    #[error(transparent)]
    ServiceUnavailable(#[from] ServiceUnavailableError),
}

/// Errors raised by the log sink lifecycle
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("log sink worker is already running")]
    AlreadyRunning,
    #[error("log sink worker did not finish draining within {0:?}")]
    DrainTimeout(std::time::Duration),
    #[error("log sink queue receiver was lost by an aborted worker")]
    ReceiverLost,
}

/// Errors raised by the tuner background loop lifecycle
#[derive(Debug, Error)]
pub enum TunerError {
    #[error("tuner loop is already running")]
    AlreadyRunning,
    #[error("tuning interval must be greater than zero")]
    ZeroInterval,
    #[error("tuner loop did not stop within {0:?}")]
    StopTimeout(std::time::Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use std::time::Duration;

    #[test]
    fn test_resource_unavailable_display() {
        let request = ResourceRequest::new("embed-42", 200.0, 10.0, Priority::High, Duration::ZERO);
        let err = ResourceUnavailableError::new(request, RejectReason::TimedOut);
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "resources unavailable for operation 'embed-42': timed out waiting for resources"
        );
    }

    #[test]
    fn test_service_unavailable_lists_attempts_in_order() {
        let err = ServiceUnavailableError {
            attempts: vec![
                AttemptFailure {
                    strategy: "primary".to_string(),
                    kind: FailureKind::Timeout,
                    message: "slow".to_string(),
                },
                AttemptFailure {
                    strategy: "cache".to_string(),
                    kind: FailureKind::Unavailable,
                    message: "empty".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("all 2 fallback strategies failed"));
        assert!(text.find("primary").unwrap() < text.find("cache").unwrap());
    }
}
