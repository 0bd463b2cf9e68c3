//! Typed error hierarchy for the step-execution engine.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `ContractError` — payload/schema violations (unrecoverable, step FAILED)
//! - `AdapterFailure` — external capability failures (recoverable, step PAUSED)
//! - `OrchestratorError` — run/step sequencing and persistence failures

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the contract registry when a payload crosses a
/// component boundary in an invalid shape.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Contract kind '{kind}' is already registered")]
    DuplicateKind { kind: String },

    #[error("Schema violation in '{kind}': field '{field}': {reason}")]
    SchemaViolation {
        kind: String,
        field: String,
        reason: String,
    },
}

/// Recoverable failures from out-of-process capabilities (planner, coder,
/// validator, GitHub integrator). Each carries enough context to render an
/// actionable operator message.
#[derive(Debug, Error)]
pub enum AdapterFailure {
    #[error("Adapter call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Adapter error: {message}")]
    Error { message: String },

    #[error("Malformed diff: {reason}")]
    MalformedDiff { reason: String },
}

impl AdapterFailure {
    /// Stable code string persisted with pause records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "adapter_timeout",
            Self::Error { .. } => "adapter_error",
            Self::MalformedDiff { .. } => "malformed_diff",
        }
    }
}

/// Errors from the orchestrator and the step state machine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid run spec: {reason}")]
    InvalidRunSpec { reason: String },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: Uuid },

    #[error("Step {step_id} not found")]
    StepNotFound { step_id: Uuid },

    #[error("Run {run_id} is paused; resume it before advancing")]
    RunPaused { run_id: Uuid },

    #[error("Step {step_id} is not paused (status: {status})")]
    NotPaused { step_id: Uuid, status: String },

    #[error("Invalid step transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a step entered PAUSED. Stored on the step record and rendered in
/// operator-facing summaries; the original finding list is never lost
/// because validation reports are retained separately.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseReason {
    GuardExceeded {
        reason: String,
        observed_value: usize,
        limit: usize,
    },
    ValidationFatal {
        fatal_count: usize,
    },
    AdapterTimeout {
        seconds: u64,
    },
    AdapterError {
        message: String,
    },
    MalformedDiff {
        reason: String,
    },
    ApplyFailure {
        message: String,
    },
}

impl PauseReason {
    /// Stable code string for events and persistence.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GuardExceeded { .. } => "guard_exceeded",
            Self::ValidationFatal { .. } => "validation_fatal",
            Self::AdapterTimeout { .. } => "adapter_timeout",
            Self::AdapterError { .. } => "adapter_error",
            Self::MalformedDiff { .. } => "malformed_diff",
            Self::ApplyFailure { .. } => "apply_failure",
        }
    }

    pub fn from_adapter(failure: &AdapterFailure) -> Self {
        match failure {
            AdapterFailure::Timeout { seconds } => Self::AdapterTimeout { seconds: *seconds },
            AdapterFailure::Error { message } => Self::AdapterError {
                message: message.clone(),
            },
            AdapterFailure::MalformedDiff { reason } => Self::MalformedDiff {
                reason: reason.clone(),
            },
        }
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GuardExceeded {
                reason,
                observed_value,
                limit,
            } => write!(
                f,
                "Size guard exceeded: {} ({} > {})",
                reason, observed_value, limit
            ),
            Self::ValidationFatal { fatal_count } => {
                write!(f, "Validation reported {} fatal finding(s)", fatal_count)
            }
            Self::AdapterTimeout { seconds } => {
                write!(f, "Adapter call timed out after {}s", seconds)
            }
            Self::AdapterError { message } => write!(f, "Adapter error: {}", message),
            Self::MalformedDiff { reason } => write!(f, "Malformed diff: {}", reason),
            Self::ApplyFailure { message } => write!(f, "Patch could not be applied: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_violation_carries_kind_and_field() {
        let err = ContractError::SchemaViolation {
            kind: "work_order".into(),
            field: "objective".into(),
            reason: "missing required field".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("work_order"));
        assert!(msg.contains("objective"));
    }

    #[test]
    fn adapter_failure_codes_are_stable() {
        assert_eq!(
            AdapterFailure::Timeout { seconds: 30 }.code(),
            "adapter_timeout"
        );
        assert_eq!(
            AdapterFailure::MalformedDiff { reason: "x".into() }.code(),
            "malformed_diff"
        );
    }

    #[test]
    fn pause_reason_from_adapter_preserves_context() {
        let failure = AdapterFailure::Error {
            message: "connection reset".into(),
        };
        let reason = PauseReason::from_adapter(&failure);
        assert_eq!(reason.code(), "adapter_error");
        assert!(reason.to_string().contains("connection reset"));
    }

    #[test]
    fn guard_exceeded_message_includes_numbers() {
        let reason = PauseReason::GuardExceeded {
            reason: "changed lines".into(),
            observed_value: 6000,
            limit: 5000,
        };
        assert!(reason.to_string().contains("6000"));
        assert!(reason.to_string().contains("5000"));
    }

    #[test]
    fn orchestrator_error_converts_from_contract_error() {
        let inner = ContractError::DuplicateKind {
            kind: "coder_result".into(),
        };
        let err: OrchestratorError = inner.into();
        assert!(matches!(err, OrchestratorError::Contract(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ContractError::DuplicateKind { kind: "x".into() });
        assert_std_error(&AdapterFailure::Timeout { seconds: 1 });
        assert_std_error(&OrchestratorError::InvalidRunSpec {
            reason: "empty".into(),
        });
    }
}
