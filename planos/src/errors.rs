//! Error taxonomy shared across the engine.
//!
//! The policy gate and the event bus never return errors for expected
//! conditions (they return structured decisions / `None`); the types here
//! cover dispatch failures, queue infrastructure failures, and caller-facing
//! engine errors. Infrastructure failures fail the affected step, never the
//! process.

use crate::types::{PlanId, StepId, StepState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed error-code taxonomy used by the dispatch client to classify backend
/// failures. Only `unavailable` and `rate_limited` are retryable; a timed-out
/// backend is terminal because blindly retrying a hung call risks duplicate
/// side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorCode {
    Unavailable,
    RateLimited,
    Timeout,
    InvalidArgument,
    Unauthorized,
    BackendRejected,
}

impl DispatchErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchErrorCode::Unavailable | DispatchErrorCode::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchErrorCode::Unavailable => "unavailable",
            DispatchErrorCode::RateLimited => "rate_limited",
            DispatchErrorCode::Timeout => "timeout",
            DispatchErrorCode::InvalidArgument => "invalid_argument",
            DispatchErrorCode::Unauthorized => "unauthorized",
            DispatchErrorCode::BackendRejected => "backend_rejected",
        }
    }
}

impl fmt::Display for DispatchErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed dispatch failure surfaced to the engine once the client's internal
/// retry budget is spent (or immediately, for terminal codes).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("dispatch failed ({code}): {message}")]
pub struct DispatchError {
    pub code: DispatchErrorCode,
    /// Whether the *outer* loop may retry this failure.
    pub retryable: bool,
    pub message: String,
}

impl DispatchError {
    pub fn new(code: DispatchErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            retryable: code.is_retryable(),
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            DispatchErrorCode::Timeout,
            format!("tool call exceeded its {}ms timeout budget", timeout_ms),
        )
    }

    pub fn unknown_tool(tool: &str) -> Self {
        Self::new(
            DispatchErrorCode::InvalidArgument,
            format!("no backend registered for tool '{}'", tool),
        )
    }
}

/// Durable queue infrastructure failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue closed")]
    Closed,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Caller-facing engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("step {step_id} not found in plan {plan_id}")]
    StepNotFound { plan_id: PlanId, step_id: StepId },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("unknown subject agent '{0}'")]
    UnknownSubject(String),

    /// An approval decision arrived for a step that is not parked in
    /// `waiting_approval`; rejected to the caller without mutating state.
    #[error("approval decision conflicts with step {step_id} of plan {plan_id} in state {state}")]
    ApprovalConflict {
        plan_id: PlanId,
        step_id: StepId,
        state: StepState,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_availability_codes_are_retryable() {
        assert!(DispatchErrorCode::Unavailable.is_retryable());
        assert!(DispatchErrorCode::RateLimited.is_retryable());
        assert!(!DispatchErrorCode::Timeout.is_retryable());
        assert!(!DispatchErrorCode::InvalidArgument.is_retryable());
        assert!(!DispatchErrorCode::Unauthorized.is_retryable());
        assert!(!DispatchErrorCode::BackendRejected.is_retryable());
    }

    #[test]
    fn timeout_error_is_terminal_for_the_outer_loop() {
        let err = DispatchError::timeout(900_000);
        assert_eq!(err.code, DispatchErrorCode::Timeout);
        assert!(!err.retryable);
    }
}
