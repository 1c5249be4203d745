//! EVOLVE - dependency-ordered schema migrations.
//!
//! Steps are declared per schema with explicit dependencies, resolved into a
//! deterministic order and applied one transaction per step under a
//! single-writer lock.

pub use evolve_core;
pub use evolve_runtime;

pub mod prelude {
    pub use evolve_core::config::EvolveConfig;
    pub use evolve_core::error::{EvolveError, OperationError, Result};
    pub use evolve_core::migration::{MigrationStep, Operation, StepKey};
    pub use evolve_core::schema::{FieldSpec, FieldType, ModelRef, NamedField, ReferentialAction};
    pub use evolve_runtime::migrations::{
        load_steps_from_dir, ApplyReport, ConversionRegistry, MemoryBackend, MigrationApplier,
        MigrationObserver, MigrationStatus, PgBackend, SchemaBackend, StepState,
    };
}
