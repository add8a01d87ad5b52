use crate::operator::LEGAL_OPERATIONS;
use crate::stage::Stage;
use thiserror::Error;

/// Broad class of a [`ProbeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected configuration, detected at realization.
    Configuration,
    /// Programmer error: evaluating something that is not ready.
    Precondition,
    /// Misuse of the lifecycle (re-realizing, mutating after realization).
    Usage,
}

/// Every error is returned to the immediate caller; nothing is retried or
/// recovered from.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    #[error(
        "{component} '{name}': invalid probe operation '{operation}'. Currently supports {}.",
        legal_operations()
    )]
    InvalidOperation {
        component: &'static str,
        name: String,
        operation: String,
    },

    #[error("probe '{name}' has not been realized")]
    NotRealized { name: String },

    #[error(
        "{component} '{name}': quantity reads {required} model coordinates but the model has {available}"
    )]
    QuantityOutOfRange {
        component: &'static str,
        name: String,
        required: usize,
        available: usize,
    },

    #[error("value requires stage {required} but the state is realized only to {current}")]
    StageNotReached { required: Stage, current: Stage },

    #[error("probe '{name}' is disabled and reports no value")]
    Disabled { name: String },

    #[error("probe '{name}' is already realized")]
    AlreadyRealized { name: String },

    #[error("probe '{name}' is realized; configuration is locked")]
    ConfigurationLocked { name: String },

    #[error("{what} dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("state does not belong to this system: unknown {what} {index}")]
    ForeignState { what: &'static str, index: usize },
}

impl ProbeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProbeError::InvalidOperation { .. } | ProbeError::QuantityOutOfRange { .. } => {
                ErrorCategory::Configuration
            }
            ProbeError::NotRealized { .. }
            | ProbeError::StageNotReached { .. }
            | ProbeError::Disabled { .. }
            | ProbeError::DimensionMismatch { .. }
            | ProbeError::ForeignState { .. } => ErrorCategory::Precondition,
            ProbeError::AlreadyRealized { .. } | ProbeError::ConfigurationLocked { .. } => {
                ErrorCategory::Usage
            }
        }
    }
}

fn legal_operations() -> String {
    let quoted: Vec<String> = LEGAL_OPERATIONS.iter().map(|op| format!("'{op}'")).collect();
    quoted.join(", ")
}
