use thiserror::Error;

use crate::migration::StepKey;

/// Core error type for EVOLVE operations.
#[derive(Error, Debug)]
pub enum EvolveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unresolved dependency {schema}.{step_id} (required by {required_by})")]
    UnresolvedDependency {
        schema: String,
        step_id: String,
        required_by: StepKey,
    },

    #[error("Cyclic dependency between steps: {}", format_keys(.steps))]
    CyclicDependency { steps: Vec<StepKey> },

    #[error("Step {0} is defined more than once")]
    DuplicateStep(StepKey),

    #[error("Step {step} failed at operation {operation_index}: {source}")]
    StepFailed {
        step: StepKey,
        operation_index: usize,
        #[source]
        source: OperationError,
    },

    #[error("Step {step} interrupted at operation {operation_index}: {source}")]
    StepInterrupted {
        step: StepKey,
        operation_index: usize,
        #[source]
        source: Box<EvolveError>,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl EvolveError {
    /// Whether the error was raised before any step was executed.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            EvolveError::UnresolvedDependency { .. }
                | EvolveError::CyclicDependency { .. }
                | EvolveError::DuplicateStep(_)
        )
    }

    /// The step the error is attributed to, if any.
    pub fn step(&self) -> Option<&StepKey> {
        match self {
            EvolveError::UnresolvedDependency { required_by, .. } => Some(required_by),
            EvolveError::DuplicateStep(key) => Some(key),
            EvolveError::StepFailed { step, .. } | EvolveError::StepInterrupted { step, .. } => {
                Some(step)
            }
            _ => None,
        }
    }

    /// Index of the operation the error occurred in, if any.
    pub fn operation_index(&self) -> Option<usize> {
        match self {
            EvolveError::StepFailed {
                operation_index, ..
            }
            | EvolveError::StepInterrupted {
                operation_index, ..
            } => Some(*operation_index),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EvolveError {
    fn from(e: serde_json::Error) -> Self {
        EvolveError::Serialization(e.to_string())
    }
}

/// Errors raised by a single schema operation inside a step.
///
/// These are local to the step: the step's transaction is rolled back and
/// previously committed steps are left in place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("Field '{field}' already exists on model '{model}'")]
    DuplicateField { model: String, field: String },

    #[error("Field '{field}' does not exist on model '{model}'")]
    MissingField { model: String, field: String },

    #[error("Cannot alter '{model}.{field}': {reason}")]
    IncompatibleAlteration {
        model: String,
        field: String,
        reason: String,
    },

    #[error("Field '{model}.{field}' references unknown model '{target}'")]
    UnknownTarget {
        model: String,
        field: String,
        target: String,
    },

    #[error("Model '{model}' already exists")]
    DuplicateModel { model: String },

    #[error("Model '{model}' does not exist")]
    MissingModel { model: String },
}

fn format_keys(keys: &[StepKey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using EvolveError.
pub type Result<T> = std::result::Result<T, EvolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_dependency_message() {
        let err = EvolveError::UnresolvedDependency {
            schema: "T".into(),
            step_id: "009".into(),
            required_by: StepKey::new("T", "010"),
        };
        assert_eq!(
            err.to_string(),
            "Unresolved dependency T.009 (required by T.010)"
        );
        assert!(err.is_pre_execution());
        assert_eq!(err.step(), Some(&StepKey::new("T", "010")));
    }

    #[test]
    fn test_cycle_message_lists_steps() {
        let err = EvolveError::CyclicDependency {
            steps: vec![StepKey::new("a", "0001"), StepKey::new("b", "0001")],
        };
        assert!(err.to_string().contains("a.0001, b.0001"));
    }

    #[test]
    fn test_step_failed_carries_source() {
        let err = EvolveError::StepFailed {
            step: StepKey::new("reports", "0009"),
            operation_index: 2,
            source: OperationError::MissingField {
                model: "reports.reportpage".into(),
                field: "report".into(),
            },
        };
        assert!(!err.is_pre_execution());
        assert!(err.to_string().contains("operation 2"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.operation_index(), Some(2));
    }

    #[test]
    fn test_step_interrupted_keeps_storage_cause() {
        let err = EvolveError::StepInterrupted {
            step: StepKey::new("reports", "0009"),
            operation_index: 1,
            source: Box::new(EvolveError::StorageUnavailable("connection reset".into())),
        };
        assert_eq!(err.step(), Some(&StepKey::new("reports", "0009")));
        assert_eq!(err.operation_index(), Some(1));
        assert!(err.to_string().contains("operation 1"));
        assert!(err.to_string().contains("connection reset"));
    }
}
