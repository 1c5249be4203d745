//! Step definitions: the immutable, declarative description of schema changes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EvolveError, Result};
use crate::schema::{FieldSpec, ModelRef, NamedField, ReferentialAction};

/// Identity of a migration step: `(schema, step_id)`.
///
/// Ordered lexically by schema, then step id. Serialized as a two-element
/// array, the way dependency lists are written in manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct StepKey {
    pub schema: String,
    pub step_id: String,
}

impl StepKey {
    pub fn new(schema: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            step_id: step_id.into(),
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.step_id)
    }
}

impl From<(String, String)> for StepKey {
    fn from((schema, step_id): (String, String)) -> Self {
        Self { schema, step_id }
    }
}

impl From<StepKey> for (String, String) {
    fn from(key: StepKey) -> Self {
        (key.schema, key.step_id)
    }
}

/// A single field- or model-level schema change.
///
/// Model names are local to the owning step's schema; relation targets inside
/// field specs are fully qualified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    CreateModel {
        name: String,
        #[serde(default)]
        fields: Vec<NamedField>,
    },
    DeleteModel {
        name: String,
    },
    AddField {
        model: String,
        name: String,
        field: FieldSpec,
    },
    RemoveField {
        model: String,
        name: String,
    },
    RenameField {
        model: String,
        old_name: String,
        new_name: String,
    },
    AlterField {
        model: String,
        name: String,
        field: FieldSpec,
    },
    AlterFieldReferentialAction {
        model: String,
        name: String,
        on_delete: ReferentialAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_update: Option<ReferentialAction>,
    },
}

impl Operation {
    /// Model this operation targets, unqualified.
    pub fn model_name(&self) -> &str {
        match self {
            Operation::CreateModel { name, .. } | Operation::DeleteModel { name } => name,
            Operation::AddField { model, .. }
            | Operation::RemoveField { model, .. }
            | Operation::RenameField { model, .. }
            | Operation::AlterField { model, .. }
            | Operation::AlterFieldReferentialAction { model, .. } => model,
        }
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateModel { name, .. } => format!("Create model {}", name),
            Operation::DeleteModel { name } => format!("Delete model {}", name),
            Operation::AddField { model, name, .. } => {
                format!("Add field {} to {}", name, model)
            }
            Operation::RemoveField { model, name } => {
                format!("Remove field {} from {}", name, model)
            }
            Operation::RenameField {
                model,
                old_name,
                new_name,
            } => format!("Rename field {} on {} to {}", old_name, model, new_name),
            Operation::AlterField { model, name, .. } => {
                format!("Alter field {} on {}", name, model)
            }
            Operation::AlterFieldReferentialAction {
                model,
                name,
                on_delete,
                ..
            } => format!(
                "Set on-delete of {}.{} to {}",
                model,
                name,
                on_delete.to_sql()
            ),
        }
    }

    fn validate(&self, schema: &str) -> Result<()> {
        let model = ModelRef::new(schema, self.model_name()).to_string();
        match self {
            Operation::CreateModel { fields, .. } => {
                for (i, f) in fields.iter().enumerate() {
                    if fields[..i].iter().any(|other| other.name == f.name) {
                        return Err(EvolveError::Manifest(format!(
                            "Model {} lists field '{}' twice",
                            model, f.name
                        )));
                    }
                    f.field.validate(&model, &f.name)?;
                }
                Ok(())
            }
            Operation::AddField { name, field, .. } | Operation::AlterField { name, field, .. } => {
                field.validate(&model, name)
            }
            Operation::RenameField {
                old_name, new_name, ..
            } if old_name == new_name => Err(EvolveError::Manifest(format!(
                "Rename of {}.{} does not change the name",
                model, old_name
            ))),
            _ => Ok(()),
        }
    }
}

/// One atomic, dependency-ordered schema change unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStep {
    pub key: StepKey,
    pub dependencies: Vec<StepKey>,
    pub operations: Vec<Operation>,
    /// Provenance, e.g. the tool and time that generated the step.
    pub generated_by: Option<String>,
    /// Marks the first step of a schema.
    pub initial: bool,
}

impl MigrationStep {
    pub fn new(schema: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            key: StepKey::new(schema, step_id),
            dependencies: Vec::new(),
            operations: Vec::new(),
            generated_by: None,
            initial: false,
        }
    }

    pub fn depends_on(mut self, schema: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.dependencies.push(StepKey::new(schema, step_id));
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn schema(&self) -> &str {
        &self.key.schema
    }

    /// Qualify a model name local to this step.
    pub fn model_ref(&self, model: &str) -> ModelRef {
        ModelRef::new(self.key.schema.clone(), model)
    }

    /// Check the step is well formed on its own.
    pub fn validate(&self) -> Result<()> {
        if self.dependencies.contains(&self.key) {
            return Err(EvolveError::Manifest(format!(
                "Step {} depends on itself",
                self.key
            )));
        }
        for op in &self.operations {
            op.validate(&self.key.schema)?;
        }
        Ok(())
    }

    /// SHA-256 over the dependencies and operations.
    pub fn checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for dep in &self.dependencies {
            hasher.update(dep.to_string().as_bytes());
            hasher.update([0u8]);
        }
        for op in &self.operations {
            hasher.update(serde_json::to_vec(op)?);
            hasher.update([0u8]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// A step that has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub key: StepKey,
    pub applied_at: DateTime<Utc>,
    pub checksum: Option<String>,
    pub execution_time_ms: Option<i64>,
}

/// The most recent failure of a step that has not been applied since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub key: StepKey,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
