pub mod migrations;

pub use migrations::{
    load_steps_from_dir, ConversionRegistry, MemoryBackend, MigrationApplier, MigrationObserver,
    MigrationStatus, PgBackend, SchemaBackend, StepState,
};
