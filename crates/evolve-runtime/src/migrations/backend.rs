//! Capabilities the migration engine needs from a relational store.

use async_trait::async_trait;

use evolve_core::error::{EvolveError, OperationError, Result};
use evolve_core::migration::{AppliedStep, StepFailure, StepKey};
use evolve_core::schema::{FieldSpec, ModelRef, NamedField, ReferentialAction};

use super::conversion::ConversionRegistry;

/// Why a single operation did not complete.
#[derive(Debug)]
pub enum OpFailure {
    /// The operation is invalid against the current schema. Local to the step.
    Operation(OperationError),
    /// The store itself failed. Fatal for the batch.
    Storage(EvolveError),
}

impl From<OperationError> for OpFailure {
    fn from(e: OperationError) -> Self {
        OpFailure::Operation(e)
    }
}

impl From<EvolveError> for OpFailure {
    fn from(e: EvolveError) -> Self {
        OpFailure::Storage(e)
    }
}

pub type OpResult = std::result::Result<(), OpFailure>;

/// A relational store that schema steps can be applied to.
///
/// Writers must hold the schema-modification lock between
/// [`acquire_lock`](SchemaBackend::acquire_lock) and
/// [`release_lock`](SchemaBackend::release_lock).
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// Block until the exclusive schema-modification lock is held.
    async fn acquire_lock(&self) -> Result<()>;

    async fn release_lock(&self) -> Result<()>;

    /// The ApplicationRecord.
    async fn applied_steps(&self) -> Result<Vec<AppliedStep>>;

    /// Failures not yet superseded by a successful application.
    async fn failures(&self) -> Result<Vec<StepFailure>>;

    async fn record_failure(&self, key: &StepKey, error: &str) -> Result<()>;

    /// Start the transaction one step is applied in.
    async fn begin(&self) -> Result<Box<dyn SchemaTransaction + '_>>;
}

/// All-or-nothing unit of schema change.
///
/// Dropping a transaction without committing discards its changes.
#[async_trait]
pub trait SchemaTransaction: Send {
    async fn create_model(&mut self, model: &ModelRef, fields: &[NamedField]) -> OpResult;

    async fn delete_model(&mut self, model: &ModelRef) -> OpResult;

    async fn add_column(&mut self, model: &ModelRef, name: &str, field: &FieldSpec) -> OpResult;

    async fn drop_column(&mut self, model: &ModelRef, name: &str) -> OpResult;

    async fn rename_column(&mut self, model: &ModelRef, old_name: &str, new_name: &str)
        -> OpResult;

    async fn alter_column(
        &mut self,
        model: &ModelRef,
        name: &str,
        field: &FieldSpec,
        conversions: &ConversionRegistry,
    ) -> OpResult;

    async fn alter_reference(
        &mut self,
        model: &ModelRef,
        name: &str,
        on_delete: ReferentialAction,
        on_update: Option<ReferentialAction>,
    ) -> OpResult;

    /// Add the step to the ApplicationRecord as part of this transaction.
    async fn record_applied(&mut self, applied: &AppliedStep) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
