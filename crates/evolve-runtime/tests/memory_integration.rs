use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use evolve_core::error::{EvolveError, OperationError, Result};
use evolve_core::migration::{AppliedStep, MigrationStep, Operation, StepFailure, StepKey};
use evolve_core::schema::{FieldSpec, FieldType, ModelRef, NamedField, ReferentialAction};
use evolve_runtime::migrations::{
    ApplyReport, ConversionRegistry, MemoryBackend, MigrationApplier, MigrationObserver,
    SchemaBackend, SchemaTransaction, StepState,
};

fn key(schema: &str, step_id: &str) -> StepKey {
    StepKey::new(schema, step_id)
}

fn person() -> ModelRef {
    ModelRef::new("S", "person")
}

/// S.001 creates `person` with a `name`, S.002 renames it to `full_name`.
fn rename_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new("S", "001")
            .operation(Operation::CreateModel {
                name: "person".into(),
                fields: vec![NamedField::new("id", FieldSpec::auto())],
            })
            .operation(Operation::AddField {
                model: "person".into(),
                name: "name".into(),
                field: FieldSpec::char(128).with_default(""),
            }),
        MigrationStep::new("S", "002")
            .depends_on("S", "001")
            .operation(Operation::RenameField {
                model: "person".into(),
                old_name: "name".into(),
                new_name: "full_name".into(),
            }),
    ]
}

/// Reports app: report, report page referencing it.
fn report_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new("reports", "0001_initial").operation(Operation::CreateModel {
            name: "Report".into(),
            fields: vec![
                NamedField::new("id", FieldSpec::auto()),
                NamedField::new("name", FieldSpec::char(255)),
            ],
        }),
        MigrationStep::new("reports", "0002_reportpage")
            .depends_on("reports", "0001_initial")
            .operation(Operation::CreateModel {
                name: "ReportPage".into(),
                fields: vec![
                    NamedField::new("id", FieldSpec::auto()),
                    NamedField::new(
                        "report",
                        FieldSpec::foreign_key(
                            ModelRef::new("reports", "report"),
                            ReferentialAction::Cascade,
                        )
                        .nullable(),
                    ),
                ],
            }),
    ]
}

#[tokio::test]
async fn test_rename_yields_full_name_and_record() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());

    let report = applier.run(&rename_steps()).await.unwrap();
    assert_eq!(report.order, vec![key("S", "001"), key("S", "002")]);

    let catalog = backend.snapshot().await;
    let table = catalog.table(&person()).unwrap();
    assert!(table.column("full_name").is_some());
    assert!(table.column("name").is_none());
    assert_eq!(
        catalog.applied_keys().into_iter().collect::<Vec<_>>(),
        vec![key("S", "001"), key("S", "002")]
    );
}

#[tokio::test]
async fn test_rename_preserves_data() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());
    let steps = rename_steps();

    applier.run(&steps[..1]).await.unwrap();
    backend
        .insert_row(&person(), [("name", Value::from("Ada Lovelace"))])
        .await
        .unwrap();
    backend
        .insert_row(&person(), [("name", Value::from("Grace Hopper"))])
        .await
        .unwrap();

    applier.run(&steps).await.unwrap();
    let catalog = backend.snapshot().await;
    let table = catalog.table(&person()).unwrap();
    assert_eq!(
        table.values("full_name"),
        vec![Value::from("Ada Lovelace"), Value::from("Grace Hopper")]
    );
    assert_eq!(table.values("id"), vec![Value::from(1), Value::from(2)]);
}

#[tokio::test]
async fn test_unresolved_dependency_names_missing_step() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());
    let steps = vec![MigrationStep::new("T", "010").depends_on("T", "009")];

    let err = applier.run(&steps).await.unwrap_err();
    match &err {
        EvolveError::UnresolvedDependency {
            schema,
            step_id,
            required_by,
        } => {
            assert_eq!(schema, "T");
            assert_eq!(step_id, "009");
            assert_eq!(required_by, &key("T", "010"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_pre_execution());
    assert!(backend.snapshot().await.applied_keys().is_empty());
}

#[tokio::test]
async fn test_cycle_applies_nothing() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());

    let mut steps = rename_steps();
    steps.push(MigrationStep::new("A", "001").depends_on("A", "002"));
    steps.push(MigrationStep::new("A", "002").depends_on("A", "001"));

    let err = applier.run(&steps).await.unwrap_err();
    match err {
        EvolveError::CyclicDependency { steps } => {
            assert_eq!(steps, vec![key("A", "001"), key("A", "002")]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    let catalog = backend.snapshot().await;
    assert!(catalog.applied_keys().is_empty());
    assert_eq!(catalog.models().count(), 0);
}

#[tokio::test]
async fn test_applying_twice_equals_applying_once() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());
    let mut steps = rename_steps();
    steps.extend(report_steps());

    applier.run(&steps).await.unwrap();
    let once = backend.snapshot().await;

    let report = applier.run(&steps).await.unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(report.skipped.len(), steps.len());
    assert_eq!(backend.snapshot().await, once);
}

#[tokio::test]
async fn test_add_then_remove_restores_shape() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());
    let steps = rename_steps();
    applier.run(&steps).await.unwrap();
    let before = backend.snapshot().await.table(&person()).cloned().unwrap();

    let mut more = steps.clone();
    more.push(
        MigrationStep::new("S", "003")
            .depends_on("S", "002")
            .operation(Operation::AddField {
                model: "person".into(),
                name: "phone".into(),
                field: FieldSpec::char(128).nullable(),
            }),
    );
    more.push(
        MigrationStep::new("S", "004")
            .depends_on("S", "003")
            .operation(Operation::RemoveField {
                model: "person".into(),
                name: "phone".into(),
            }),
    );
    applier.run(&more).await.unwrap();

    let after = backend.snapshot().await.table(&person()).cloned().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_failure_keeps_earlier_steps_and_rolls_back_its_own() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());

    let mut steps = rename_steps();
    steps.push(
        MigrationStep::new("S", "003")
            .depends_on("S", "002")
            .operation(Operation::AddField {
                model: "person".into(),
                name: "phone".into(),
                field: FieldSpec::char(128).nullable(),
            })
            .operation(Operation::AddField {
                model: "person".into(),
                name: "full_name".into(),
                field: FieldSpec::char(128).nullable(),
            }),
    );
    steps.push(MigrationStep::new("S", "004").depends_on("S", "003"));

    let outcome = applier.execute(&steps).await;
    let err = outcome.result.as_ref().unwrap_err();
    assert!(matches!(
        err,
        EvolveError::StepFailed {
            operation_index: 1,
            source: OperationError::DuplicateField { .. },
            ..
        }
    ));
    assert_eq!(err.step(), Some(&key("S", "003")));
    assert_eq!(outcome.report.failed(), Some(&key("S", "003")));
    assert_eq!(outcome.report.pending(), vec![&key("S", "004")]);
    assert_eq!(
        outcome.report.state(&key("S", "002")),
        Some(StepState::Applied)
    );

    let catalog = backend.snapshot().await;
    assert!(catalog.table(&person()).unwrap().column("phone").is_none());
    assert_eq!(catalog.applied_keys().len(), 2);
}

#[tokio::test]
async fn test_reference_to_unknown_model() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());

    let steps = vec![MigrationStep::new("reports", "0001_initial").operation(
        Operation::CreateModel {
            name: "ReportPage".into(),
            fields: vec![NamedField::new(
                "report",
                FieldSpec::foreign_key(
                    ModelRef::new("reports", "report"),
                    ReferentialAction::Cascade,
                ),
            )],
        },
    )];

    let err = applier.run(&steps).await.unwrap_err();
    assert!(matches!(
        err,
        EvolveError::StepFailed {
            source: OperationError::UnknownTarget { ref target, .. },
            ..
        } if target == "reports.report"
    ));
}

#[tokio::test]
async fn test_alter_referential_action() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());

    let mut steps = report_steps();
    steps.push(
        MigrationStep::new("reports", "0003_set_null")
            .depends_on("reports", "0002_reportpage")
            .operation(Operation::AlterFieldReferentialAction {
                model: "reportpage".into(),
                name: "report".into(),
                on_delete: ReferentialAction::SetNull,
                on_update: None,
            }),
    );
    applier.run(&steps).await.unwrap();

    let catalog = backend.snapshot().await;
    let page = catalog
        .table(&ModelRef::new("reports", "reportpage"))
        .unwrap();
    let reference = page.column("report").unwrap().field.reference.as_ref().unwrap();
    assert_eq!(reference.on_delete, ReferentialAction::SetNull);
    assert_eq!(reference.on_update, ReferentialAction::DoNothing);

    let not_a_reference = vec![MigrationStep::new("reports", "0004_bad")
        .depends_on("reports", "0003_set_null")
        .operation(Operation::AlterFieldReferentialAction {
            model: "report".into(),
            name: "name".into(),
            on_delete: ReferentialAction::Cascade,
            on_update: None,
        })];
    let mut all = steps.clone();
    all.extend(not_a_reference);
    let err = applier.run(&all).await.unwrap_err();
    assert!(matches!(
        err,
        EvolveError::StepFailed {
            source: OperationError::IncompatibleAlteration { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_alter_field_shrink_policy() {
    let shrink = MigrationStep::new("S", "003")
        .depends_on("S", "002")
        .operation(Operation::AlterField {
            model: "person".into(),
            name: "full_name".into(),
            field: FieldSpec::char(4).with_default(""),
        });
    let mut steps = rename_steps();
    steps.push(shrink);

    let strict_backend = Arc::new(MemoryBackend::new());
    let strict = MigrationApplier::new(strict_backend.clone());
    strict.run(&steps[..1]).await.unwrap();
    strict_backend
        .insert_row(&person(), [("name", Value::from("Naam"))])
        .await
        .unwrap();
    strict_backend
        .insert_row(&person(), [("name", Value::from("Full name"))])
        .await
        .unwrap();
    let err = strict.run(&steps).await.unwrap_err();
    assert!(matches!(
        err,
        EvolveError::StepFailed {
            source: OperationError::IncompatibleAlteration { .. },
            ..
        }
    ));

    let lenient_backend = Arc::new(MemoryBackend::new());
    let lenient = MigrationApplier::new(lenient_backend.clone())
        .with_conversions(ConversionRegistry::standard().with_truncation(true));
    lenient.run(&steps[..1]).await.unwrap();
    lenient_backend
        .insert_row(&person(), [("name", Value::from("Full name"))])
        .await
        .unwrap();
    lenient.run(&steps).await.unwrap();
    let catalog = lenient_backend.snapshot().await;
    assert_eq!(
        catalog.table(&person()).unwrap().values("full_name"),
        vec![Value::from("Full")]
    );
}

#[tokio::test]
async fn test_alter_field_type_conversion() {
    let backend = Arc::new(MemoryBackend::new());
    let applier = MigrationApplier::new(backend.clone());

    let mut steps = vec![MigrationStep::new("S", "001").operation(Operation::CreateModel {
        name: "person".into(),
        fields: vec![
            NamedField::new("id", FieldSpec::auto()),
            NamedField::new("age", FieldSpec::char(8).nullable()),
        ],
    })];
    applier.run(&steps).await.unwrap();
    backend
        .insert_row(&person(), [("age", Value::from("42"))])
        .await
        .unwrap();
    backend.insert_row(&person(), [("age", Value::Null)]).await.unwrap();

    steps.push(
        MigrationStep::new("S", "002")
            .depends_on("S", "001")
            .operation(Operation::AlterField {
                model: "person".into(),
                name: "age".into(),
                field: FieldSpec::new(FieldType::PositiveInteger).with_default(0),
            }),
    );
    applier.run(&steps).await.unwrap();

    let catalog = backend.snapshot().await;
    let table = catalog.table(&person()).unwrap();
    assert_eq!(table.values("age"), vec![Value::from(42), Value::from(0)]);
    assert_eq!(
        table.column("age").unwrap().field.field_type,
        FieldType::PositiveInteger
    );
}

#[tokio::test]
async fn test_concurrent_appliers_apply_each_step_once() {
    let backend = Arc::new(MemoryBackend::new());
    let first = MigrationApplier::new(backend.clone());
    let second = MigrationApplier::new(backend.clone());
    let steps = rename_steps();

    let (a, b) = tokio::join!(first.run(&steps), second.run(&steps));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.applied.len() + b.applied.len(), 2);
    assert_eq!(a.skipped.len() + b.skipped.len(), 2);
    assert_eq!(backend.snapshot().await.applied_keys().len(), 2);
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl MigrationObserver for RecordingObserver {
    fn batch_started(&self, _run_id: uuid::Uuid, pending: usize) {
        self.push(format!("batch {}", pending));
    }

    fn step_started(&self, key: &StepKey) {
        self.push(format!("start {}", key));
    }

    fn step_applied(&self, key: &StepKey, _elapsed: Duration) {
        self.push(format!("applied {}", key));
    }

    fn step_failed(&self, key: &StepKey, _error: &EvolveError) {
        self.push(format!("failed {}", key));
    }

    fn batch_finished(&self, report: &ApplyReport) {
        self.push(format!("done {}", report.applied.len()));
    }
}

#[tokio::test]
async fn test_observer_sees_events_in_order() {
    let backend = Arc::new(MemoryBackend::new());
    let observer = Arc::new(RecordingObserver::default());
    let applier = MigrationApplier::new(backend).with_observer(observer.clone());

    applier.run(&rename_steps()).await.unwrap();

    let events = observer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "batch 2",
            "start S.001",
            "applied S.001",
            "start S.002",
            "applied S.002",
            "done 2",
        ]
    );
}

/// Delays `begin` from the n-th transaction on.
struct SlowBackend {
    inner: MemoryBackend,
    slow_from: usize,
    delay: Duration,
    begun: AtomicUsize,
}

#[async_trait]
impl SchemaBackend for SlowBackend {
    async fn acquire_lock(&self) -> Result<()> {
        self.inner.acquire_lock().await
    }

    async fn release_lock(&self) -> Result<()> {
        self.inner.release_lock().await
    }

    async fn applied_steps(&self) -> Result<Vec<AppliedStep>> {
        self.inner.applied_steps().await
    }

    async fn failures(&self) -> Result<Vec<StepFailure>> {
        self.inner.failures().await
    }

    async fn record_failure(&self, key: &StepKey, error: &str) -> Result<()> {
        self.inner.record_failure(key, error).await
    }

    async fn begin(&self) -> Result<Box<dyn SchemaTransaction + '_>> {
        if self.begun.fetch_add(1, Ordering::SeqCst) >= self.slow_from {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.begin().await
    }
}

#[tokio::test]
async fn test_batch_timeout_keeps_committed_steps() {
    let backend = Arc::new(SlowBackend {
        inner: MemoryBackend::new(),
        slow_from: 1,
        delay: Duration::from_secs(30),
        begun: AtomicUsize::new(0),
    });
    let applier = MigrationApplier::new(backend.clone())
        .with_batch_timeout(Some(Duration::from_millis(200)));

    let outcome = applier.execute(&rename_steps()).await;
    assert!(matches!(outcome.result, Err(EvolveError::Timeout(_))));
    assert_eq!(outcome.report.applied, vec![key("S", "001")]);
    assert_eq!(
        outcome.report.state(&key("S", "002")),
        Some(StepState::Pending)
    );

    let catalog = backend.inner.snapshot().await;
    assert_eq!(catalog.applied_keys().len(), 1);

    // The lock was released despite the timeout.
    tokio_test::assert_ok!(backend.inner.acquire_lock().await);
}

/// Goes offline right after opening transaction number `offline_after`.
struct OutageBackend {
    inner: MemoryBackend,
    offline_after: usize,
    begun: AtomicUsize,
}

#[async_trait]
impl SchemaBackend for OutageBackend {
    async fn acquire_lock(&self) -> Result<()> {
        self.inner.acquire_lock().await
    }

    async fn release_lock(&self) -> Result<()> {
        self.inner.release_lock().await
    }

    async fn applied_steps(&self) -> Result<Vec<AppliedStep>> {
        self.inner.applied_steps().await
    }

    async fn failures(&self) -> Result<Vec<StepFailure>> {
        self.inner.failures().await
    }

    async fn record_failure(&self, key: &StepKey, error: &str) -> Result<()> {
        self.inner.record_failure(key, error).await
    }

    async fn begin(&self) -> Result<Box<dyn SchemaTransaction + '_>> {
        let tx = self.inner.begin().await?;
        if self.begun.fetch_add(1, Ordering::SeqCst) >= self.offline_after {
            self.inner.set_available(false);
        }
        Ok(tx)
    }
}

#[tokio::test]
async fn test_storage_failure_mid_step_names_operation() {
    let backend = Arc::new(OutageBackend {
        inner: MemoryBackend::new(),
        offline_after: 1,
        begun: AtomicUsize::new(0),
    });
    let applier = MigrationApplier::new(backend.clone());

    let outcome = applier.execute(&rename_steps()).await;
    match &outcome.result {
        Err(EvolveError::StepInterrupted {
            step,
            operation_index,
            source,
        }) => {
            assert_eq!(step, &key("S", "002"));
            assert_eq!(*operation_index, 0);
            assert!(matches!(**source, EvolveError::StorageUnavailable(_)));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(outcome.report.applied, vec![key("S", "001")]);

    backend.inner.set_available(true);
    let catalog = backend.inner.snapshot().await;
    assert_eq!(catalog.applied_keys().len(), 1);
}

#[tokio::test]
async fn test_lock_timeout() {
    let backend = Arc::new(MemoryBackend::new());
    backend.acquire_lock().await.unwrap();

    let applier = MigrationApplier::new(backend.clone())
        .with_lock_timeout(Some(Duration::from_millis(50)));
    let err = applier.run(&rename_steps()).await.unwrap_err();
    assert!(matches!(err, EvolveError::Timeout(_)));
    assert!(backend.snapshot().await.applied_keys().is_empty());

    backend.release_lock().await.unwrap();
    tokio_test::assert_ok!(applier.run(&rename_steps()).await);
}
