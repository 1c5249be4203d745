//! In-process schema store.
//!
//! Holds the catalog (models, columns and row data) plus the ApplicationRecord
//! behind a single `RwLock`. A transaction validates its operations against a
//! private copy of the catalog and journals them. Commit replays the journal
//! onto the live catalog under the write lock, so rows written concurrently
//! through [`MemoryBackend::insert_row`] are kept and readers observe either
//! the state before a step or the state after it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use evolve_core::error::{EvolveError, OperationError, Result};
use evolve_core::migration::{AppliedStep, StepFailure, StepKey};
use evolve_core::schema::{FieldSpec, FieldType, ModelRef, NamedField, ReferentialAction};

use super::backend::{OpFailure, OpResult, SchemaBackend, SchemaTransaction};
use super::conversion::ConversionRegistry;

/// A row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// A column and its field specification.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub field: FieldSpec,
}

/// A model's table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Values of one column, in row order.
    pub fn values(&self, column: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Tables plus the ApplicationRecord.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    tables: BTreeMap<ModelRef, Table>,
    applied: BTreeMap<StepKey, AppliedStep>,
}

impl Catalog {
    pub fn table(&self, model: &ModelRef) -> Option<&Table> {
        self.tables.get(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelRef> {
        self.tables.keys()
    }

    pub fn applied_keys(&self) -> BTreeSet<StepKey> {
        self.applied.keys().cloned().collect()
    }

    fn require_table(&self, model: &ModelRef) -> std::result::Result<&Table, OperationError> {
        self.tables
            .get(model)
            .ok_or_else(|| OperationError::MissingModel {
                model: model.to_string(),
            })
    }

    fn require_table_mut(
        &mut self,
        model: &ModelRef,
    ) -> std::result::Result<&mut Table, OperationError> {
        self.tables
            .get_mut(model)
            .ok_or_else(|| OperationError::MissingModel {
                model: model.to_string(),
            })
    }

    fn check_target(
        &self,
        model: &ModelRef,
        name: &str,
        field: &FieldSpec,
    ) -> std::result::Result<(), OperationError> {
        if let Some(reference) = &field.reference {
            if &reference.to != model && !self.tables.contains_key(&reference.to) {
                return Err(OperationError::UnknownTarget {
                    model: model.to_string(),
                    field: name.to_string(),
                    target: reference.to.to_string(),
                });
            }
        }
        Ok(())
    }

    fn create_model(
        &mut self,
        model: &ModelRef,
        fields: &[NamedField],
    ) -> std::result::Result<(), OperationError> {
        if self.tables.contains_key(model) {
            return Err(OperationError::DuplicateModel {
                model: model.to_string(),
            });
        }
        for f in fields {
            self.check_target(model, &f.name, &f.field)?;
        }
        let columns = fields
            .iter()
            .map(|f| Column {
                name: f.name.clone(),
                field: f.field.clone(),
            })
            .collect();
        self.tables.insert(
            model.clone(),
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    fn delete_model(&mut self, model: &ModelRef) -> std::result::Result<(), OperationError> {
        self.require_table(model)?;
        for (other, table) in &self.tables {
            if other == model {
                continue;
            }
            for column in &table.columns {
                if column.field.reference.as_ref().map(|r| &r.to) == Some(model) {
                    return Err(OperationError::IncompatibleAlteration {
                        model: other.to_string(),
                        field: column.name.clone(),
                        reason: format!("still references {}", model),
                    });
                }
            }
        }
        self.tables.remove(model);
        Ok(())
    }

    fn add_column(
        &mut self,
        model: &ModelRef,
        name: &str,
        field: &FieldSpec,
    ) -> std::result::Result<(), OperationError> {
        if self.require_table(model)?.column(name).is_some() {
            return Err(OperationError::DuplicateField {
                model: model.to_string(),
                field: name.to_string(),
            });
        }
        self.check_target(model, name, field)?;

        let table = self.require_table_mut(model)?;
        let is_auto = field.field_type == FieldType::Auto;
        if !field.nullable && field.default.is_none() && !is_auto && !table.rows.is_empty() {
            return Err(OperationError::IncompatibleAlteration {
                model: model.to_string(),
                field: name.to_string(),
                reason: format!(
                    "non-nullable field without default on a table with {} rows",
                    table.rows.len()
                ),
            });
        }

        let fill = field.fill_value();
        for (i, row) in table.rows.iter_mut().enumerate() {
            let value = if is_auto {
                Value::from(i as i64 + 1)
            } else {
                fill.clone()
            };
            row.insert(name.to_string(), value);
        }
        table.columns.push(Column {
            name: name.to_string(),
            field: field.clone(),
        });
        Ok(())
    }

    fn drop_column(&mut self, model: &ModelRef, name: &str) -> std::result::Result<(), OperationError> {
        let table = self.require_table_mut(model)?;
        let pos = table
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| OperationError::MissingField {
                model: model.to_string(),
                field: name.to_string(),
            })?;
        table.columns.remove(pos);
        for row in &mut table.rows {
            row.remove(name);
        }
        Ok(())
    }

    fn rename_column(
        &mut self,
        model: &ModelRef,
        old_name: &str,
        new_name: &str,
    ) -> std::result::Result<(), OperationError> {
        let table = self.require_table_mut(model)?;
        if table.column(new_name).is_some() {
            return Err(OperationError::DuplicateField {
                model: model.to_string(),
                field: new_name.to_string(),
            });
        }
        let column = table
            .columns
            .iter_mut()
            .find(|c| c.name == old_name)
            .ok_or_else(|| OperationError::MissingField {
                model: model.to_string(),
                field: old_name.to_string(),
            })?;
        column.name = new_name.to_string();
        for row in &mut table.rows {
            if let Some(value) = row.remove(old_name) {
                row.insert(new_name.to_string(), value);
            }
        }
        Ok(())
    }

    fn alter_column(
        &mut self,
        model: &ModelRef,
        name: &str,
        field: &FieldSpec,
        conversions: &ConversionRegistry,
    ) -> std::result::Result<(), OperationError> {
        let old = self
            .require_table(model)?
            .column(name)
            .map(|c| c.field.clone())
            .ok_or_else(|| OperationError::MissingField {
                model: model.to_string(),
                field: name.to_string(),
            })?;
        self.check_target(model, name, field)?;

        let table = self.require_table_mut(model)?;
        let mut converted = Vec::with_capacity(table.rows.len());
        for (i, row) in table.rows.iter().enumerate() {
            let value = row.get(name).cloned().unwrap_or(Value::Null);
            let value = conversions.coerce(&old, field, value).map_err(|reason| {
                OperationError::IncompatibleAlteration {
                    model: model.to_string(),
                    field: name.to_string(),
                    reason: format!("row {}: {}", i, reason),
                }
            })?;
            converted.push(value);
        }

        for (row, value) in table.rows.iter_mut().zip(converted) {
            row.insert(name.to_string(), value);
        }
        if let Some(column) = table.columns.iter_mut().find(|c| c.name == name) {
            column.field = field.clone();
        }
        Ok(())
    }

    fn alter_reference(
        &mut self,
        model: &ModelRef,
        name: &str,
        on_delete: ReferentialAction,
        on_update: Option<ReferentialAction>,
    ) -> std::result::Result<(), OperationError> {
        let column = self
            .require_table(model)?
            .column(name)
            .ok_or_else(|| OperationError::MissingField {
                model: model.to_string(),
                field: name.to_string(),
            })?;
        let reference = column.field.reference.as_ref().ok_or_else(|| {
            OperationError::IncompatibleAlteration {
                model: model.to_string(),
                field: name.to_string(),
                reason: "field is not a reference".to_string(),
            }
        })?;
        if !self.tables.contains_key(&reference.to) {
            return Err(OperationError::UnknownTarget {
                model: model.to_string(),
                field: name.to_string(),
                target: reference.to.to_string(),
            });
        }
        if on_delete == ReferentialAction::SetNull && !column.field.nullable {
            return Err(OperationError::IncompatibleAlteration {
                model: model.to_string(),
                field: name.to_string(),
                reason: "SET NULL requires a nullable field".to_string(),
            });
        }

        let table = self.require_table_mut(model)?;
        if let Some(reference) = table
            .columns
            .iter_mut()
            .find(|c| c.name == name)
            .and_then(|c| c.field.reference.as_mut())
        {
            reference.on_delete = on_delete;
            if let Some(on_update) = on_update {
                reference.on_update = on_update;
            }
        }
        Ok(())
    }

    fn record(&mut self, applied: &AppliedStep) -> Result<()> {
        if self.applied.contains_key(&applied.key) {
            return Err(EvolveError::InvalidState(format!(
                "step {} is already recorded as applied",
                applied.key
            )));
        }
        self.applied.insert(applied.key.clone(), applied.clone());
        Ok(())
    }

    fn insert_row(
        &mut self,
        model: &ModelRef,
        values: Row,
    ) -> std::result::Result<(), OperationError> {
        let table = self.require_table_mut(model)?;
        if let Some(unknown) = values.keys().find(|k| table.column(k).is_none()) {
            return Err(OperationError::MissingField {
                model: model.to_string(),
                field: unknown.clone(),
            });
        }

        let mut row = Row::new();
        for column in &table.columns {
            let value = match values.get(&column.name) {
                Some(v) => v.clone(),
                None if column.field.field_type == FieldType::Auto => {
                    let next = table
                        .rows
                        .iter()
                        .filter_map(|r| r.get(&column.name).and_then(Value::as_i64))
                        .max()
                        .unwrap_or(0)
                        + 1;
                    Value::from(next)
                }
                None => column.field.fill_value(),
            };
            row.insert(column.name.clone(), value);
        }
        table.rows.push(row);
        Ok(())
    }
}

/// Schema store that lives in process memory.
pub struct MemoryBackend {
    catalog: RwLock<Catalog>,
    failures: RwLock<BTreeMap<StepKey, StepFailure>>,
    lock: Arc<Mutex<()>>,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            failures: RwLock::new(BTreeMap::new()),
            lock: Arc::new(Mutex::new(())),
            guard: Mutex::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Consistent copy of the committed catalog.
    pub async fn snapshot(&self) -> Catalog {
        self.catalog.read().await.clone()
    }

    /// Insert a row outside of any migration, e.g. to seed data.
    pub async fn insert_row<I, K>(
        &self,
        model: &ModelRef,
        values: I,
    ) -> std::result::Result<(), OperationError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let row: Row = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.catalog.write().await.insert_row(model, row)
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EvolveError::StorageUnavailable(
                "memory backend is offline".to_string(),
            ))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaBackend for MemoryBackend {
    async fn acquire_lock(&self) -> Result<()> {
        debug!("Acquiring migration lock...");
        let guard = self.lock.clone().lock_owned().await;
        *self.guard.lock().await = Some(guard);
        debug!("Migration lock acquired");
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        if self.guard.lock().await.take().is_none() {
            return Err(EvolveError::InvalidState(
                "migration lock is not held".to_string(),
            ));
        }
        debug!("Migration lock released");
        Ok(())
    }

    async fn applied_steps(&self) -> Result<Vec<AppliedStep>> {
        self.check_available()?;
        Ok(self.catalog.read().await.applied.values().cloned().collect())
    }

    async fn failures(&self) -> Result<Vec<StepFailure>> {
        self.check_available()?;
        Ok(self.failures.read().await.values().cloned().collect())
    }

    async fn record_failure(&self, key: &StepKey, error: &str) -> Result<()> {
        self.check_available()?;
        self.failures.write().await.insert(
            key.clone(),
            StepFailure {
                key: key.clone(),
                error: error.to_string(),
                failed_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn SchemaTransaction + '_>> {
        self.check_available()?;
        let working = self.catalog.read().await.clone();
        Ok(Box::new(MemoryTransaction {
            backend: self,
            working,
            journal: Vec::new(),
        }))
    }
}

/// A change made by a transaction, replayed on the live catalog at commit.
#[derive(Debug, Clone)]
enum Change {
    CreateModel(ModelRef, Vec<NamedField>),
    DeleteModel(ModelRef),
    AddColumn(ModelRef, String, FieldSpec),
    DropColumn(ModelRef, String),
    RenameColumn(ModelRef, String, String),
    AlterColumn(ModelRef, String, FieldSpec, ConversionRegistry),
    AlterReference(ModelRef, String, ReferentialAction, Option<ReferentialAction>),
    Record(AppliedStep),
}

impl Change {
    fn apply(&self, catalog: &mut Catalog) -> OpResult {
        match self {
            Change::CreateModel(model, fields) => catalog.create_model(model, fields)?,
            Change::DeleteModel(model) => catalog.delete_model(model)?,
            Change::AddColumn(model, name, field) => catalog.add_column(model, name, field)?,
            Change::DropColumn(model, name) => catalog.drop_column(model, name)?,
            Change::RenameColumn(model, old_name, new_name) => {
                catalog.rename_column(model, old_name, new_name)?
            }
            Change::AlterColumn(model, name, field, conversions) => {
                catalog.alter_column(model, name, field, conversions)?
            }
            Change::AlterReference(model, name, on_delete, on_update) => {
                catalog.alter_reference(model, name, *on_delete, *on_update)?
            }
            Change::Record(applied) => catalog.record(applied)?,
        }
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    backend: &'a MemoryBackend,
    working: Catalog,
    journal: Vec<Change>,
}

impl MemoryTransaction<'_> {
    /// Apply to the private copy, journaling the change if it succeeds.
    fn stage(&mut self, change: Change) -> OpResult {
        self.backend.check_available()?;
        change.apply(&mut self.working)?;
        self.journal.push(change);
        Ok(())
    }
}

#[async_trait]
impl SchemaTransaction for MemoryTransaction<'_> {
    async fn create_model(&mut self, model: &ModelRef, fields: &[NamedField]) -> OpResult {
        self.stage(Change::CreateModel(model.clone(), fields.to_vec()))
    }

    async fn delete_model(&mut self, model: &ModelRef) -> OpResult {
        self.stage(Change::DeleteModel(model.clone()))
    }

    async fn add_column(&mut self, model: &ModelRef, name: &str, field: &FieldSpec) -> OpResult {
        self.stage(Change::AddColumn(model.clone(), name.to_string(), field.clone()))
    }

    async fn drop_column(&mut self, model: &ModelRef, name: &str) -> OpResult {
        self.stage(Change::DropColumn(model.clone(), name.to_string()))
    }

    async fn rename_column(
        &mut self,
        model: &ModelRef,
        old_name: &str,
        new_name: &str,
    ) -> OpResult {
        self.stage(Change::RenameColumn(
            model.clone(),
            old_name.to_string(),
            new_name.to_string(),
        ))
    }

    async fn alter_column(
        &mut self,
        model: &ModelRef,
        name: &str,
        field: &FieldSpec,
        conversions: &ConversionRegistry,
    ) -> OpResult {
        self.stage(Change::AlterColumn(
            model.clone(),
            name.to_string(),
            field.clone(),
            conversions.clone(),
        ))
    }

    async fn alter_reference(
        &mut self,
        model: &ModelRef,
        name: &str,
        on_delete: ReferentialAction,
        on_update: Option<ReferentialAction>,
    ) -> OpResult {
        self.stage(Change::AlterReference(
            model.clone(),
            name.to_string(),
            on_delete,
            on_update,
        ))
    }

    async fn record_applied(&mut self, applied: &AppliedStep) -> Result<()> {
        match self.stage(Change::Record(applied.clone())) {
            Ok(()) => Ok(()),
            Err(OpFailure::Storage(e)) => Err(e),
            Err(OpFailure::Operation(e)) => Err(EvolveError::InvalidState(e.to_string())),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.backend.check_available()?;
        let MemoryTransaction {
            backend, journal, ..
        } = *self;

        let mut live = backend.catalog.write().await;
        let mut next = live.clone();
        for change in &journal {
            change.apply(&mut next).map_err(|failure| match failure {
                OpFailure::Operation(e) => EvolveError::InvalidState(format!(
                    "concurrent write conflicts with migration: {}",
                    e
                )),
                OpFailure::Storage(e) => e,
            })?;
        }
        *live = next;
        drop(live);

        let mut failures = backend.failures.write().await;
        for change in &journal {
            if let Change::Record(applied) = change {
                failures.remove(&applied.key);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!("Discarding uncommitted schema changes");
        Ok(())
    }
}
