use serde::{Deserialize, Serialize};

/// PostgreSQL column types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    /// Auto-incrementing 32-bit integer
    Serial,
    /// Variable-length string with optional max length
    Varchar(Option<u32>),
    /// Unlimited text
    Text,
    /// 32-bit integer
    Integer,
    /// 64-bit integer
    BigInt,
    /// 64-bit floating point
    DoublePrecision,
    /// Boolean
    Boolean,
    /// Timestamp with timezone
    Timestamptz,
    /// Date without time
    Date,
    /// Decimal with precision and scale
    Decimal(u8, u8),
    /// JSONB for structured data
    Jsonb,
}

impl SqlType {
    /// Generate the SQL type declaration.
    pub fn to_sql(&self) -> String {
        match self {
            SqlType::Serial => "SERIAL".to_string(),
            SqlType::Varchar(None) => "VARCHAR(255)".to_string(),
            SqlType::Varchar(Some(len)) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::DoublePrecision => "DOUBLE PRECISION".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Timestamptz => "TIMESTAMPTZ".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Decimal(p, s) => format!("DECIMAL({}, {})", p, s),
            SqlType::Jsonb => "JSONB".to_string(),
        }
    }

    /// `information_schema.columns.data_type` of a column declared with this type.
    pub fn data_type_name(&self) -> &'static str {
        match self {
            SqlType::Serial | SqlType::Integer => "integer",
            SqlType::Varchar(_) => "character varying",
            SqlType::Text => "text",
            SqlType::BigInt => "bigint",
            SqlType::DoublePrecision => "double precision",
            SqlType::Boolean => "boolean",
            SqlType::Timestamptz => "timestamp with time zone",
            SqlType::Date => "date",
            SqlType::Decimal(_, _) => "numeric",
            SqlType::Jsonb => "jsonb",
        }
    }

    /// Inclusive range of integers the column can hold.
    pub fn integer_range(&self) -> Option<(i64, i64)> {
        match self {
            SqlType::Serial | SqlType::Integer => Some((i32::MIN as i64, i32::MAX as i64)),
            SqlType::BigInt => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Type used when this column is the target of a cast (`SERIAL` is not a type).
    pub fn to_cast_sql(&self) -> String {
        match self {
            SqlType::Serial => "INTEGER".to_string(),
            other => other.to_sql(),
        }
    }
}

/// Field kinds understood by the migration engine.
///
/// Names follow the model-field vocabulary the manifests are written in
/// (`char`, `positive_integer`, `foreign_key`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Auto,
    Integer,
    PositiveInteger,
    BigInteger,
    Float,
    Decimal,
    Boolean,
    Char,
    Text,
    Slug,
    Email,
    Url,
    Date,
    DateTime,
    Json,
    File,
    Image,
    ForeignKey,
    OneToOne,
}

impl FieldType {
    pub const ALL: [FieldType; 19] = [
        FieldType::Auto,
        FieldType::Integer,
        FieldType::PositiveInteger,
        FieldType::BigInteger,
        FieldType::Float,
        FieldType::Decimal,
        FieldType::Boolean,
        FieldType::Char,
        FieldType::Text,
        FieldType::Slug,
        FieldType::Email,
        FieldType::Url,
        FieldType::Date,
        FieldType::DateTime,
        FieldType::Json,
        FieldType::File,
        FieldType::Image,
        FieldType::ForeignKey,
        FieldType::OneToOne,
    ];

    /// Parse a field class name such as `CharField` or `ForeignKey`.
    pub fn from_type_string(type_str: &str) -> Option<Self> {
        let name = type_str.trim();
        let name = name.strip_suffix("Field").unwrap_or(name);
        let ty = match name {
            "Auto" => FieldType::Auto,
            "Integer" => FieldType::Integer,
            "PositiveInteger" => FieldType::PositiveInteger,
            "BigInteger" => FieldType::BigInteger,
            "Float" => FieldType::Float,
            "Decimal" => FieldType::Decimal,
            "Boolean" => FieldType::Boolean,
            "Char" => FieldType::Char,
            "Text" => FieldType::Text,
            "Slug" => FieldType::Slug,
            "Email" => FieldType::Email,
            "URL" | "Url" => FieldType::Url,
            "Date" => FieldType::Date,
            "DateTime" => FieldType::DateTime,
            "JSON" | "Json" => FieldType::Json,
            "File" => FieldType::File,
            "Image" => FieldType::Image,
            "ForeignKey" => FieldType::ForeignKey,
            "OneToOne" => FieldType::OneToOne,
            _ => return None,
        };
        Some(ty)
    }

    /// Map to corresponding SQL type.
    pub fn to_sql_type(&self, max_length: Option<u32>) -> SqlType {
        match self {
            FieldType::Auto => SqlType::Serial,
            FieldType::Integer | FieldType::PositiveInteger => SqlType::Integer,
            FieldType::BigInteger => SqlType::BigInt,
            FieldType::Float => SqlType::DoublePrecision,
            FieldType::Decimal => SqlType::Decimal(12, 2),
            FieldType::Boolean => SqlType::Boolean,
            FieldType::Char | FieldType::Email | FieldType::Url => SqlType::Varchar(max_length),
            FieldType::Slug => SqlType::Varchar(Some(max_length.unwrap_or(50))),
            FieldType::File | FieldType::Image => SqlType::Varchar(Some(max_length.unwrap_or(100))),
            FieldType::Text => SqlType::Text,
            FieldType::Date => SqlType::Date,
            FieldType::DateTime => SqlType::Timestamptz,
            FieldType::Json => SqlType::Jsonb,
            FieldType::ForeignKey | FieldType::OneToOne => SqlType::Integer,
        }
    }

    /// Whether values of this kind are stored as strings.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FieldType::Char
                | FieldType::Text
                | FieldType::Slug
                | FieldType::Email
                | FieldType::Url
                | FieldType::File
                | FieldType::Image
                | FieldType::Date
                | FieldType::DateTime
        )
    }

    /// Whether values of this kind are stored as integers.
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            FieldType::Auto
                | FieldType::Integer
                | FieldType::PositiveInteger
                | FieldType::BigInteger
                | FieldType::ForeignKey
                | FieldType::OneToOne
        )
    }

    /// Whether values of this kind are calendar dates or timestamps.
    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }

    /// Whether this kind points at another model.
    pub fn is_relation(&self) -> bool {
        matches!(self, FieldType::ForeignKey | FieldType::OneToOne)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_to_sql() {
        assert_eq!(SqlType::Serial.to_sql(), "SERIAL");
        assert_eq!(SqlType::Varchar(Some(100)).to_sql(), "VARCHAR(100)");
        assert_eq!(SqlType::Decimal(10, 2).to_sql(), "DECIMAL(10, 2)");
        assert_eq!(SqlType::Serial.to_cast_sql(), "INTEGER");
    }

    #[test]
    fn test_field_type_parsing() {
        assert_eq!(FieldType::from_type_string("CharField"), Some(FieldType::Char));
        assert_eq!(
            FieldType::from_type_string("PositiveIntegerField"),
            Some(FieldType::PositiveInteger)
        );
        assert_eq!(FieldType::from_type_string("ForeignKey"), Some(FieldType::ForeignKey));
        assert_eq!(FieldType::from_type_string("OneToOneField"), Some(FieldType::OneToOne));
        assert_eq!(FieldType::from_type_string("ManyToManyField"), None);
    }

    #[test]
    fn test_field_type_to_sql() {
        assert_eq!(FieldType::Char.to_sql_type(Some(64)), SqlType::Varchar(Some(64)));
        assert_eq!(FieldType::Slug.to_sql_type(None), SqlType::Varchar(Some(50)));
        assert_eq!(FieldType::Boolean.to_sql_type(None), SqlType::Boolean);
        assert_eq!(FieldType::ForeignKey.to_sql_type(None), SqlType::Integer);
    }

    #[test]
    fn test_storage_ranges_and_catalog_names() {
        assert_eq!(
            FieldType::PositiveInteger.to_sql_type(None).integer_range(),
            Some((i32::MIN as i64, i32::MAX as i64))
        );
        assert_eq!(
            FieldType::BigInteger.to_sql_type(None).integer_range(),
            Some((i64::MIN, i64::MAX))
        );
        assert_eq!(SqlType::Text.integer_range(), None);
        assert_eq!(SqlType::Serial.data_type_name(), "integer");
        assert_eq!(SqlType::Varchar(Some(15)).data_type_name(), "character varying");
        assert!(FieldType::ALL
            .iter()
            .all(|ty| FieldType::ALL.iter().filter(|t| *t == ty).count() == 1));
    }

    #[test]
    fn test_field_type_serde_names() {
        let json = serde_json::to_string(&FieldType::PositiveInteger).unwrap();
        assert_eq!(json, "\"positive_integer\"");
        let ty: FieldType = serde_json::from_str("\"one_to_one\"").unwrap();
        assert_eq!(ty, FieldType::OneToOne);
    }
}
