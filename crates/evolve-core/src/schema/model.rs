use std::fmt;

use serde::{Deserialize, Serialize};

use super::field::FieldSpec;

/// Reference to a model inside a schema, written `schema.model`.
///
/// Model names are case-insensitive and stored lower-cased; schema names keep
/// their case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelRef {
    pub schema: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(schema: impl Into<String>, model: impl AsRef<str>) -> Self {
        Self {
            schema: schema.into(),
            model: model.as_ref().to_lowercase(),
        }
    }

    /// Parse `schema.model`.
    pub fn parse(s: &str) -> Option<Self> {
        let (schema, model) = s.split_once('.')?;
        if schema.is_empty() || model.is_empty() || model.contains('.') {
            return None;
        }
        Some(Self::new(schema, model))
    }

    /// Physical table name (`<schema>_<model>`).
    pub fn table_name(&self) -> String {
        format!("{}_{}", self.schema, self.model)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.model)
    }
}

impl TryFrom<String> for ModelRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ModelRef::parse(&value).ok_or_else(|| format!("invalid model reference '{}'", value))
    }
}

impl From<ModelRef> for String {
    fn from(value: ModelRef) -> Self {
        value.to_string()
    }
}

/// A field together with its name, as listed by `CreateModel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedField {
    pub name: String,
    pub field: FieldSpec,
}

impl NamedField {
    pub fn new(name: impl Into<String>, field: FieldSpec) -> Self {
        Self {
            name: name.into(),
            field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ref_parse() {
        let m = ModelRef::parse("reports.ReportPage").unwrap();
        assert_eq!(m.schema, "reports");
        assert_eq!(m.model, "reportpage");
        assert_eq!(m.to_string(), "reports.reportpage");
        assert_eq!(m.table_name(), "reports_reportpage");
    }

    #[test]
    fn test_model_ref_rejects_malformed() {
        assert!(ModelRef::parse("reports").is_none());
        assert!(ModelRef::parse(".page").is_none());
        assert!(ModelRef::parse("a.b.c").is_none());
    }
}
