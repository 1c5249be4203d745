mod applier;
mod backend;
mod conversion;
mod manifest;
mod memory;
mod observer;
mod postgres;
mod resolver;
mod state;

pub use applier::{ApplyReport, BatchOutcome, MigrationApplier, MigrationStatus};
pub use backend::{OpFailure, OpResult, SchemaBackend, SchemaTransaction};
pub use conversion::{ConversionFn, ConversionRegistry};
pub use manifest::{load_steps_from_dir, parse_step};
pub use memory::{Catalog, Column, MemoryBackend, Row, Table};
pub use observer::{MigrationObserver, TracingObserver};
pub use postgres::PgBackend;
pub use resolver::{pending, resolve};
pub use state::StepState;
