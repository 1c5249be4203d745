//! Loading step definitions from manifest files.
//!
//! Layout: `<dir>/<schema>/<step_id>.toml`, one step per file.
//!
//! ```toml
//! generated_by = "Django 2.2.8 on 2020-10-26 15:13"
//! dependencies = [["reports", "0013_renderedreport"]]
//!
//! [[operations]]
//! kind = "add_field"
//! model = "report"
//! name = "is_static"
//! field = { type = "boolean", default = false }
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use evolve_core::error::{EvolveError, Result};
use evolve_core::migration::{MigrationStep, Operation, StepKey};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepManifest {
    #[serde(default)]
    generated_by: Option<String>,
    #[serde(default)]
    initial: bool,
    #[serde(default)]
    dependencies: Vec<StepKey>,
    #[serde(default)]
    operations: Vec<Operation>,
}

/// Parse one manifest; the key comes from where the file lives.
pub fn parse_step(schema: &str, step_id: &str, content: &str) -> Result<MigrationStep> {
    let manifest: StepManifest = toml::from_str(content).map_err(|e| {
        EvolveError::Manifest(format!("{}.{}: {}", schema, step_id, e))
    })?;

    let mut step = MigrationStep::new(schema, step_id);
    step.generated_by = manifest.generated_by;
    step.initial = manifest.initial;
    step.dependencies = manifest.dependencies;
    step.operations = manifest.operations;
    Ok(step)
}

/// Load every step below `dir`.
///
/// Schemas are the immediate subdirectories; steps are the `.toml` files in
/// them. Both are returned sorted by name. A missing directory has no steps.
pub fn load_steps_from_dir(dir: &Path) -> Result<Vec<MigrationStep>> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let mut schema_dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            schema_dirs.push(path);
        }
    }
    schema_dirs.sort();

    let mut steps = Vec::new();
    for schema_dir in schema_dirs {
        let schema = file_name(&schema_dir)?;

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&schema_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map(|e| e == "toml").unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let step_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    EvolveError::Manifest(format!("Invalid manifest filename: {:?}", path))
                })?;
            let content = std::fs::read_to_string(&path)?;
            steps.push(parse_step(&schema, step_id, &content)?);
        }
    }

    debug!("Loaded {} migration steps", steps.len());
    Ok(steps)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| EvolveError::Manifest(format!("Invalid schema directory: {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolve_core::schema::{FieldType, ModelRef, ReferentialAction};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_steps_from_nonexistent_dir() {
        let steps = load_steps_from_dir(Path::new("/nonexistent/path")).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn test_load_steps_sorted_by_schema_then_id() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("reports")).unwrap();
        fs::create_dir(dir.path().join("Questionaire")).unwrap();

        fs::write(dir.path().join("reports/0002_second.toml"), "").unwrap();
        fs::write(dir.path().join("reports/0001_initial.toml"), "initial = true").unwrap();
        fs::write(dir.path().join("Questionaire/0001_initial.toml"), "").unwrap();

        let steps = load_steps_from_dir(dir.path()).unwrap();
        let keys: Vec<String> = steps.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "Questionaire.0001_initial",
                "reports.0001_initial",
                "reports.0002_second",
            ]
        );
        assert!(steps[1].initial);
    }

    #[test]
    fn test_load_steps_ignores_other_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("reports")).unwrap();
        fs::write(dir.path().join("reports/0001_initial.toml"), "").unwrap();
        fs::write(dir.path().join("reports/__init__.py"), "").unwrap();
        fs::write(dir.path().join("reports/0002.toml.bak"), "").unwrap();
        fs::write(dir.path().join("README.md"), "").unwrap();

        let steps = load_steps_from_dir(dir.path()).unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn test_parse_step_with_operations() {
        let content = r#"
            generated_by = "Django 3.0.12 on 2021-02-15 11:05"
            dependencies = [["reports", "0013_renderedreport"]]

            [[operations]]
            kind = "add_field"
            model = "report"
            name = "is_static"
            field = { type = "boolean", default = false }

            [[operations]]
            kind = "alter_field_referential_action"
            model = "reportpage"
            name = "report"
            on_delete = "set_null"
        "#;
        let step = parse_step("reports", "0014_report_is_static", content).unwrap();
        assert_eq!(step.dependencies, vec![StepKey::new("reports", "0013_renderedreport")]);
        assert_eq!(step.operations.len(), 2);
        match &step.operations[0] {
            Operation::AddField { field, .. } => {
                assert_eq!(field.field_type, FieldType::Boolean);
                assert_eq!(field.default, Some(serde_json::Value::Bool(false)));
            }
            other => panic!("unexpected operation: {:?}", other),
        }
        assert!(matches!(
            step.operations[1],
            Operation::AlterFieldReferentialAction {
                on_delete: ReferentialAction::SetNull,
                on_update: None,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_create_model_with_reference() {
        let content = r#"
            initial = true

            [[operations]]
            kind = "create_model"
            name = "reportpage"

            [[operations.fields]]
            name = "id"
            field = { type = "auto", primary_key = true }

            [[operations.fields]]
            name = "report"
            field = { type = "foreign_key", reference = { to = "reports.report", on_delete = "cascade" } }
        "#;
        let step = parse_step("reports", "0001_initial", content).unwrap();
        match &step.operations[0] {
            Operation::CreateModel { fields, .. } => {
                let reference = fields[1].field.reference.as_ref().unwrap();
                assert_eq!(reference.to, ModelRef::new("reports", "Report"));
            }
            other => panic!("unexpected operation: {:?}", other),
        }
    }

    #[test]
    fn test_parse_step_rejects_unknown_keys() {
        let err = parse_step("reports", "0001", "depends = []").unwrap_err();
        assert!(matches!(err, EvolveError::Manifest(_)));
        assert!(err.to_string().contains("reports.0001"));
    }
}
