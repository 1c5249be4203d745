//! Core types for EVOLVE: step definitions, the field model, configuration
//! and the error taxonomy shared by the runtime and the CLI.

pub mod config;
pub mod error;
pub mod migration;
pub mod schema;

pub use config::EvolveConfig;
pub use error::{EvolveError, OperationError, Result};
pub use migration::{AppliedStep, MigrationStep, Operation, StepFailure, StepKey};
pub use schema::{FieldSpec, FieldType, ModelRef, NamedField, ReferentialAction};
