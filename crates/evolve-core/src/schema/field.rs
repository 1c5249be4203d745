use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::ModelRef;
use super::types::{FieldType, SqlType};
use crate::error::{EvolveError, Result};

/// Specification of a model field as carried by field-bearing operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field kind.
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Whether the column accepts NULL.
    #[serde(default)]
    pub nullable: bool,

    /// Default value applied to existing rows and new inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Maximum length for string kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,

    /// Help text shown in forms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_name: Option<String>,

    /// Allowed values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,

    /// Primary key flag.
    #[serde(default)]
    pub primary_key: bool,

    /// Unique constraint flag.
    #[serde(default)]
    pub unique: bool,

    /// Target and referential behavior for relation kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,
}

impl FieldSpec {
    /// Create a non-nullable field of the given kind.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            nullable: false,
            default: None,
            max_length: None,
            help_text: None,
            verbose_name: None,
            choices: Vec::new(),
            primary_key: false,
            unique: false,
            reference: None,
        }
    }

    /// Auto-incrementing primary key.
    pub fn auto() -> Self {
        let mut spec = Self::new(FieldType::Auto);
        spec.primary_key = true;
        spec
    }

    /// Bounded string field.
    pub fn char(max_length: u32) -> Self {
        let mut spec = Self::new(FieldType::Char);
        spec.max_length = Some(max_length);
        spec
    }

    /// Foreign key to another model.
    pub fn foreign_key(to: ModelRef, on_delete: ReferentialAction) -> Self {
        let mut spec = Self::new(FieldType::ForeignKey);
        spec.reference = Some(Reference::new(to, on_delete));
        spec
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_help_text(mut self, text: impl Into<String>) -> Self {
        self.help_text = Some(text.into());
        self
    }

    /// SQL type for this field.
    pub fn sql_type(&self) -> SqlType {
        self.field_type.to_sql_type(self.max_length)
    }

    /// Longest string the column holds, as enforced by its SQL type.
    pub fn max_chars(&self) -> Option<u32> {
        match self.sql_type() {
            SqlType::Varchar(Some(len)) => Some(len),
            SqlType::Varchar(None) => Some(255),
            _ => None,
        }
    }

    /// Value stored in existing rows when the column is introduced.
    pub fn fill_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }

    /// Check internal consistency of the specification.
    pub fn validate(&self, model: &str, name: &str) -> Result<()> {
        if self.field_type.is_relation() && self.reference.is_none() {
            return Err(EvolveError::Manifest(format!(
                "Field {}.{} is a relation but has no reference target",
                model, name
            )));
        }
        if !self.field_type.is_relation() && self.reference.is_some() {
            return Err(EvolveError::Manifest(format!(
                "Field {}.{} declares a reference but is not a relation",
                model, name
            )));
        }
        if let Some(reference) = &self.reference {
            if reference.on_delete == ReferentialAction::SetNull && !self.nullable {
                return Err(EvolveError::Manifest(format!(
                    "Field {}.{} uses SET NULL on delete but is not nullable",
                    model, name
                )));
            }
        }
        if let Some(default) = &self.default {
            if !self.choices.is_empty() && !self.choices.iter().any(|c| &c.value == default) {
                return Err(EvolveError::Manifest(format!(
                    "Default of {}.{} is not one of its choices",
                    model, name
                )));
            }
        }
        Ok(())
    }

    /// Generate SQL column definition.
    pub fn to_sql_column(&self, column_name: &str) -> String {
        let mut parts = vec![quote_ident(column_name), self.sql_type().to_sql()];

        if self.primary_key {
            parts.push("PRIMARY KEY".to_string());
        }

        if !self.nullable && !self.primary_key {
            parts.push("NOT NULL".to_string());
        }

        if self.unique && !self.primary_key {
            parts.push("UNIQUE".to_string());
        }

        if let Some(ref default) = self.default {
            parts.push(format!("DEFAULT {}", sql_literal(default)));
        }

        if self.field_type == FieldType::PositiveInteger {
            parts.push(format!("CHECK ({} >= 0)", quote_ident(column_name)));
        }

        if let Some(ref reference) = self.reference {
            parts.push(reference.to_sql());
        }

        parts.join(" ")
    }
}

/// One allowed value of a field with choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub value: Value,
    pub label: String,
}

/// Target of a relation field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced model.
    pub to: ModelRef,

    #[serde(default)]
    pub on_delete: ReferentialAction,

    #[serde(default = "default_on_update")]
    pub on_update: ReferentialAction,
}

impl Reference {
    pub fn new(to: ModelRef, on_delete: ReferentialAction) -> Self {
        Self {
            to,
            on_delete,
            on_update: default_on_update(),
        }
    }

    /// `REFERENCES` clause for a column definition.
    pub fn to_sql(&self) -> String {
        format!(
            "REFERENCES {} (id) ON DELETE {} ON UPDATE {}",
            quote_ident(&self.to.table_name()),
            self.on_delete.to_sql(),
            self.on_update.to_sql()
        )
    }
}

fn default_on_update() -> ReferentialAction {
    ReferentialAction::DoNothing
}

/// Behavior of a reference when the referenced row is deleted or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    Cascade,
    Protect,
    Restrict,
    SetNull,
    SetDefault,
    DoNothing,
}

impl ReferentialAction {
    pub fn to_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::Protect | ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::DoNothing => "NO ACTION",
        }
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a JSON value as an SQL literal.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'::jsonb", other.to_string().replace('\'', "''")),
    }
}
