//! Migration applier with single-writer locking.
//!
//! Holds the backend's schema-modification lock for the whole batch, applies
//! each pending step in its own transaction and records it in the same
//! transaction, so a step is either fully applied and recorded or not at all.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use evolve_core::config::EvolveConfig;
use evolve_core::error::{EvolveError, Result};
use evolve_core::migration::{AppliedStep, MigrationStep, Operation, StepFailure, StepKey};

use super::backend::{OpFailure, OpResult, SchemaBackend, SchemaTransaction};
use super::conversion::ConversionRegistry;
use super::observer::{MigrationObserver, TracingObserver};
use super::resolver;
use super::state::StepState;

/// What happened to each step of a batch.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub run_id: Uuid,
    /// Resolved application order.
    pub order: Vec<StepKey>,
    /// Steps applied by this batch, in order.
    pub applied: Vec<StepKey>,
    /// Steps skipped because they were already applied.
    pub skipped: Vec<StepKey>,
    states: Vec<(StepKey, StepState)>,
}

impl ApplyReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            order: Vec::new(),
            applied: Vec::new(),
            skipped: Vec::new(),
            states: Vec::new(),
        }
    }

    /// Final state of a step, if it was part of the resolved order.
    pub fn state(&self, key: &StepKey) -> Option<StepState> {
        self.states.iter().find(|(k, _)| k == key).map(|(_, s)| *s)
    }

    /// The step that failed, if any.
    pub fn failed(&self) -> Option<&StepKey> {
        self.states
            .iter()
            .find(|(_, s)| *s == StepState::Failed)
            .map(|(k, _)| k)
    }

    /// Steps still pending after the batch.
    pub fn pending(&self) -> Vec<&StepKey> {
        self.states
            .iter()
            .filter(|(_, s)| *s == StepState::Pending)
            .map(|(k, _)| k)
            .collect()
    }

    fn set_state(&mut self, key: &StepKey, state: StepState) {
        match self.states.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = state,
            None => self.states.push((key.clone(), state)),
        }
    }

    fn abandon_in_flight(&mut self) {
        for (key, state) in &mut self.states {
            if *state == StepState::Applying {
                match state.abandon() {
                    Ok(next) => *state = next,
                    Err(e) => warn!("Cannot reset {}: {}", key, e),
                }
            }
        }
    }
}

/// A report together with the batch result.
#[derive(Debug)]
pub struct BatchOutcome {
    pub report: ApplyReport,
    pub result: Result<()>,
}

impl BatchOutcome {
    pub fn into_result(self) -> Result<ApplyReport> {
        self.result.map(|()| self.report)
    }
}

/// Applied, pending, failed and drifted steps relative to a set of definitions.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    pub applied: Vec<AppliedStep>,
    pub pending: Vec<StepKey>,
    pub failed: Vec<StepFailure>,
    /// Applied steps whose definition changed since they were applied.
    pub drifted: Vec<StepKey>,
    /// Applied steps with no current definition.
    pub unknown: Vec<StepKey>,
}

/// Applies migration steps to a schema backend.
pub struct MigrationApplier {
    backend: Arc<dyn SchemaBackend>,
    conversions: ConversionRegistry,
    observer: Arc<dyn MigrationObserver>,
    batch_timeout: Option<Duration>,
    lock_timeout: Option<Duration>,
}

impl MigrationApplier {
    pub fn new(backend: Arc<dyn SchemaBackend>) -> Self {
        Self {
            backend,
            conversions: ConversionRegistry::standard(),
            observer: Arc::new(TracingObserver::default()),
            batch_timeout: None,
            lock_timeout: None,
        }
    }

    /// Applier configured from the `[migrations]` and `[logging]` sections.
    pub fn from_config(backend: Arc<dyn SchemaBackend>, config: &EvolveConfig) -> Self {
        let observer = TracingObserver::new(Duration::from_millis(
            config.logging.slow_step_threshold_ms,
        ));
        Self::new(backend)
            .with_conversions(
                ConversionRegistry::standard()
                    .with_truncation(config.migrations.truncate_on_shrink),
            )
            .with_observer(Arc::new(observer))
            .with_batch_timeout(config.migrations.batch_timeout())
            .with_lock_timeout(config.migrations.lock_timeout())
    }

    pub fn with_conversions(mut self, conversions: ConversionRegistry) -> Self {
        self.conversions = conversions;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MigrationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Apply all pending steps.
    ///
    /// Steps already in the ApplicationRecord are skipped, so running the same
    /// batch again is a no-op.
    pub async fn run(&self, steps: &[MigrationStep]) -> Result<ApplyReport> {
        self.execute(steps).await.into_result()
    }

    /// Like [`run`](Self::run) but keeps the report when the batch fails.
    pub async fn execute(&self, steps: &[MigrationStep]) -> BatchOutcome {
        let mut report = ApplyReport::new(Uuid::new_v4());

        if let Err(e) = self.acquire_lock().await {
            return BatchOutcome {
                report,
                result: Err(e),
            };
        }

        let result = match self.batch_timeout {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.apply_batch(steps, &mut report)).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        report.abandon_in_flight();
                        Err(EvolveError::Timeout(format!(
                            "migration batch exceeded {:?}",
                            limit
                        )))
                    }
                }
            }
            None => self.apply_batch(steps, &mut report).await,
        };

        // Always release lock, even on error
        if let Err(e) = self.backend.release_lock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        self.observer.batch_finished(&report);
        BatchOutcome { report, result }
    }

    /// Pending steps in application order, without touching the schema.
    pub async fn plan(&self, steps: &[MigrationStep]) -> Result<Vec<StepKey>> {
        validate_all(steps)?;
        let order = resolver::resolve(steps)?;
        let applied: HashSet<StepKey> = self
            .backend
            .applied_steps()
            .await?
            .into_iter()
            .map(|a| a.key)
            .collect();
        Ok(resolver::pending(&order, &applied)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Compare the ApplicationRecord with the given definitions.
    pub async fn status(&self, steps: &[MigrationStep]) -> Result<MigrationStatus> {
        let order = resolver::resolve(steps)?;
        let applied = self.backend.applied_steps().await?;
        let failed = self.backend.failures().await?;

        let defined: HashMap<&StepKey, &MigrationStep> =
            order.iter().map(|s| (&s.key, *s)).collect();
        let applied_keys: HashSet<StepKey> = applied.iter().map(|a| a.key.clone()).collect();

        let mut drifted = Vec::new();
        let mut unknown = Vec::new();
        for record in &applied {
            match defined.get(&record.key) {
                Some(step) => {
                    if let Some(checksum) = &record.checksum {
                        if *checksum != step.checksum()? {
                            drifted.push(record.key.clone());
                        }
                    }
                }
                None => unknown.push(record.key.clone()),
            }
        }

        Ok(MigrationStatus {
            applied,
            pending: resolver::pending(&order, &applied_keys)
                .into_iter()
                .cloned()
                .collect(),
            failed,
            drifted,
            unknown,
        })
    }

    async fn acquire_lock(&self) -> Result<()> {
        match self.lock_timeout {
            Some(limit) => tokio::time::timeout(limit, self.backend.acquire_lock())
                .await
                .map_err(|_| {
                    EvolveError::Timeout(format!(
                        "could not acquire migration lock within {:?}",
                        limit
                    ))
                })?,
            None => self.backend.acquire_lock().await,
        }
    }

    async fn apply_batch(&self, steps: &[MigrationStep], report: &mut ApplyReport) -> Result<()> {
        validate_all(steps)?;
        let order = resolver::resolve(steps)?;
        report.order = order.iter().map(|s| s.key.clone()).collect();

        let records = self.backend.applied_steps().await?;
        let recorded: HashMap<StepKey, Option<String>> =
            records.into_iter().map(|a| (a.key, a.checksum)).collect();
        let mut applied: HashSet<StepKey> = recorded.keys().cloned().collect();
        let failed: HashSet<StepKey> = self
            .backend
            .failures()
            .await?
            .into_iter()
            .map(|f| f.key)
            .collect();

        for step in &order {
            let state = if applied.contains(&step.key) {
                StepState::Applied
            } else if failed.contains(&step.key) {
                StepState::Failed
            } else {
                StepState::Pending
            };
            report.set_state(&step.key, state);
        }

        let pending = order.iter().filter(|s| !applied.contains(&s.key)).count();
        debug!("Already applied migrations: {:?}", applied);
        self.observer.batch_started(report.run_id, pending);

        for step in order {
            if let Some(checksum) = recorded.get(&step.key) {
                if let Some(applied_checksum) = checksum {
                    if *applied_checksum != step.checksum()? {
                        warn!("Migration {} has changed since it was applied", step.key);
                    }
                }
                report.skipped.push(step.key.clone());
                self.observer.step_skipped(&step.key);
                continue;
            }

            if let Some(missing) = step.dependencies.iter().find(|d| !applied.contains(*d)) {
                return Err(EvolveError::InvalidState(format!(
                    "{} reached before its dependency {}",
                    step.key, missing
                )));
            }

            let state = if failed.contains(&step.key) {
                info!("Retrying migration {} after an earlier failure", step.key);
                StepState::Failed.clear()?
            } else {
                StepState::Pending
            };
            let state = state.start()?;
            report.set_state(&step.key, state);
            self.observer.step_started(&step.key);

            let started = Instant::now();
            match self.apply_step(step, started).await {
                Ok(()) => {
                    report.set_state(&step.key, state.succeed()?);
                    report.applied.push(step.key.clone());
                    applied.insert(step.key.clone());
                    self.observer.step_applied(&step.key, started.elapsed());
                }
                Err(e) => {
                    report.set_state(&step.key, state.fail()?);
                    self.observer.step_failed(&step.key, &e);
                    if let Err(record_err) =
                        self.backend.record_failure(&step.key, &e.to_string()).await
                    {
                        warn!(
                            "Failed to record failure of migration {}: {}",
                            step.key, record_err
                        );
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn apply_step(&self, step: &MigrationStep, started: Instant) -> Result<()> {
        let mut tx = self.backend.begin().await?;

        for (index, operation) in step.operations.iter().enumerate() {
            debug!("{} [{}]: {}", step.key, index, operation.describe());
            if let Err(failure) = self.apply_operation(&mut *tx, step, operation).await {
                if let Err(e) = tx.rollback().await {
                    warn!("Failed to roll back migration {}: {}", step.key, e);
                }
                return Err(match failure {
                    OpFailure::Operation(source) => EvolveError::StepFailed {
                        step: step.key.clone(),
                        operation_index: index,
                        source,
                    },
                    OpFailure::Storage(e) => EvolveError::StepInterrupted {
                        step: step.key.clone(),
                        operation_index: index,
                        source: Box::new(e),
                    },
                });
            }
        }

        let record = AppliedStep {
            key: step.key.clone(),
            applied_at: Utc::now(),
            checksum: Some(step.checksum()?),
            execution_time_ms: Some(started.elapsed().as_millis() as i64),
        };
        if let Err(e) = tx.record_applied(&record).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Failed to roll back migration {}: {}", step.key, rollback_err);
            }
            return Err(e);
        }

        tx.commit().await
    }

    async fn apply_operation(
        &self,
        tx: &mut (dyn SchemaTransaction + '_),
        step: &MigrationStep,
        operation: &Operation,
    ) -> OpResult {
        let model = step.model_ref(operation.model_name());
        match operation {
            Operation::CreateModel { fields, .. } => tx.create_model(&model, fields).await,
            Operation::DeleteModel { .. } => tx.delete_model(&model).await,
            Operation::AddField { name, field, .. } => tx.add_column(&model, name, field).await,
            Operation::RemoveField { name, .. } => tx.drop_column(&model, name).await,
            Operation::RenameField {
                old_name, new_name, ..
            } => tx.rename_column(&model, old_name, new_name).await,
            Operation::AlterField { name, field, .. } => {
                tx.alter_column(&model, name, field, &self.conversions)
                    .await
            }
            Operation::AlterFieldReferentialAction {
                name,
                on_delete,
                on_update,
                ..
            } => {
                tx.alter_reference(&model, name, *on_delete, *on_update)
                    .await
            }
        }
    }
}

fn validate_all(steps: &[MigrationStep]) -> Result<()> {
    for step in steps {
        step.validate()?;
    }
    Ok(())
}
