//! Conversion of existing column values when a field is altered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use evolve_core::schema::{FieldSpec, FieldType};
use serde_json::Value;

/// Converts one non-null value; the error string explains the rejection.
pub type ConversionFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Registry of value conversions between field types.
///
/// Lookup order: a registered conversion for the exact `(from, to)` pair, then
/// the built-in conversions. A pair with neither has no conversion, and any
/// non-null value in the column makes the alteration incompatible.
#[derive(Clone)]
pub struct ConversionRegistry {
    custom: HashMap<(FieldType, FieldType), ConversionFn>,
    builtin: bool,
    truncate_on_shrink: bool,
}

impl ConversionRegistry {
    /// Built-in conversions, rejecting over-long strings.
    pub fn standard() -> Self {
        Self {
            custom: HashMap::new(),
            builtin: true,
            truncate_on_shrink: false,
        }
    }

    /// Only identity conversions between identical types.
    pub fn empty() -> Self {
        Self {
            custom: HashMap::new(),
            builtin: false,
            truncate_on_shrink: false,
        }
    }

    pub fn with_truncation(mut self, truncate: bool) -> Self {
        self.truncate_on_shrink = truncate;
        self
    }

    pub fn truncates(&self) -> bool {
        self.truncate_on_shrink
    }

    /// Register a conversion, replacing any existing one for the pair.
    pub fn register<F>(&mut self, from: FieldType, to: FieldType, f: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.custom.insert((from, to), Arc::new(f));
    }

    pub fn has_conversion(&self, from: FieldType, to: FieldType) -> bool {
        from == to
            || self.custom.contains_key(&(from, to))
            || (self.builtin && builtin_exists(from, to))
    }

    /// Convert `value` from the `old` field to the `new` one and check it
    /// against the new constraints.
    pub fn coerce(&self, old: &FieldSpec, new: &FieldSpec, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return fill_null(new);
        }

        let from = old.field_type;
        let to = new.field_type;
        let converted = if let Some(f) = self.custom.get(&(from, to)) {
            (**f)(&value)?
        } else if from == to {
            value
        } else if self.builtin && builtin_exists(from, to) {
            builtin_convert(to, &value)?
        } else {
            return Err(format!("no conversion from {:?} to {:?}", from, to));
        };

        self.check_constraints(new, converted)
    }

    /// Source type of the first registered conversion into `to` whose source
    /// is stored as `data_type`, in `FieldType` order.
    pub fn custom_for_column(&self, data_type: &str, to: FieldType) -> Option<FieldType> {
        FieldType::ALL
            .iter()
            .filter(|from| from.to_sql_type(None).data_type_name() == data_type)
            .find(|from| self.custom.contains_key(&(**from, to)))
            .copied()
    }

    /// Whether any field type stored as `data_type` converts into `to`.
    pub fn has_column_conversion(&self, data_type: &str, to: FieldType) -> bool {
        FieldType::ALL.iter().any(|from| {
            from.to_sql_type(None).data_type_name() == data_type && self.has_conversion(*from, to)
        })
    }

    fn check_constraints(&self, new: &FieldSpec, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return fill_null(new);
        }

        let value = match (new.max_chars(), value) {
            (Some(max), Value::String(s)) => {
                let len = s.chars().count();
                if len <= max as usize {
                    Value::String(s)
                } else if self.truncate_on_shrink {
                    Value::String(s.chars().take(max as usize).collect())
                } else {
                    return Err(format!("value of length {} exceeds max length {}", len, max));
                }
            }
            (_, v) => v,
        };

        if let (Some((min, max)), Some(n)) = (new.sql_type().integer_range(), value.as_i64()) {
            if n < min || n > max {
                return Err(format!("{} is out of range for {}", n, new.sql_type().to_cast_sql()));
            }
        }

        if new.field_type == FieldType::PositiveInteger {
            if let Some(n) = value.as_i64() {
                if n < 0 {
                    return Err(format!("{} is not a positive integer", n));
                }
            }
        }

        if !new.choices.is_empty() && !new.choices.iter().any(|c| c.value == value) {
            return Err(format!("{} is not one of the allowed choices", value));
        }

        Ok(value)
    }
}

impl Default for ConversionRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for ConversionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .field("builtin", &self.builtin)
            .field("truncate_on_shrink", &self.truncate_on_shrink)
            .finish()
    }
}

/// Value used for a NULL under the new field specification.
fn fill_null(new: &FieldSpec) -> Result<Value, String> {
    if new.nullable {
        Ok(Value::Null)
    } else if let Some(default) = &new.default {
        Ok(default.clone())
    } else {
        Err("NULL value in a non-nullable field without default".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Integral,
    Real,
    Text,
    Temporal,
    Boolean,
    Json,
}

fn family(ty: FieldType) -> Family {
    if ty.is_integral() {
        Family::Integral
    } else if ty.is_temporal() {
        Family::Temporal
    } else if ty.is_textual() {
        Family::Text
    } else {
        match ty {
            FieldType::Float | FieldType::Decimal => Family::Real,
            FieldType::Boolean => Family::Boolean,
            _ => Family::Json,
        }
    }
}

fn builtin_exists(from: FieldType, to: FieldType) -> bool {
    use Family::*;
    let (from, to) = (family(from), family(to));
    from == to
        || to == Json
        || to == Text
        || matches!(
            (from, to),
            (Integral, Real) | (Real, Integral) | (Boolean, Integral) | (Integral, Boolean)
                | (Text, Integral) | (Text, Real) | (Text, Boolean) | (Text, Temporal)
        )
}

fn builtin_convert(to: FieldType, value: &Value) -> Result<Value, String> {
    match family(to) {
        Family::Json => Ok(value.clone()),
        Family::Text => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        Family::Temporal => match value {
            Value::String(s) => parse_temporal(to, s.trim())
                .ok_or_else(|| format!("'{}' is not an ISO 8601 {}", s, temporal_name(to))),
            other => Err(format!("cannot convert {} to a {}", other, temporal_name(to))),
        },
        Family::Integral => match value {
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else {
                    match n.as_f64() {
                        // i64::MAX as f64 rounds up to 2^63, which does not fit.
                        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                            Ok(Value::from(f as i64))
                        }
                        Some(f) if f.fract() == 0.0 => Err(format!("{} is out of integer range", n)),
                        _ => Err(format!("{} is not a whole number", n)),
                    }
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not an integer", s)),
            other => Err(format!("cannot convert {} to an integer", other)),
        },
        Family::Real => match value {
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| format!("{} is not a number", n)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not a number", s)),
            other => Err(format!("cannot convert {} to a number", other)),
        },
        Family::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(format!("{} is not a boolean", n)),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
            other => Err(format!("cannot convert {} to a boolean", other)),
        },
    }
}

/// Normalized ISO 8601 text for a date (`YYYY-MM-DD`) or timestamp (RFC 3339, UTC).
fn parse_temporal(to: FieldType, s: &str) -> Option<Value> {
    let timestamp = DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|t| t.and_utc())
        });

    match to {
        FieldType::Date => timestamp
            .map(|t| t.date_naive())
            .or_else(|| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .map(|d| Value::from(d.format("%Y-%m-%d").to_string())),
        _ => timestamp
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|t| t.and_utc())
            })
            .map(|t| Value::from(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
    }
}

fn temporal_name(ty: FieldType) -> &'static str {
    if ty == FieldType::Date {
        "date"
    } else {
        "timestamp"
    }
}
