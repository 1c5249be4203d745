mod field;
mod model;
mod types;

pub use field::{quote_ident, sql_literal, Choice, FieldSpec, Reference, ReferentialAction};
pub use model::{ModelRef, NamedField};
pub use types::{FieldType, SqlType};
