//! Row decoding and the type-casting hooks.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! Two hooks exist. [`CastHook::Query`] is applied to text-protocol queries
//! and turns `TINYINT(1)`/`BIT` flags into booleans. [`CastHook::Execute`] is
//! applied to prepared statements and only converts dates. Dates become Unix
//! epoch milliseconds (UTC) unless the connection asked for date strings.

use crate::models::{DatabaseType, JsonRow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Bit,
    DateTime,
    Date,
    Text,
    Binary,
    Json,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let upper = type_name.to_ascii_uppercase();

    match upper.as_str() {
        "BOOLEAN" | "BOOL" => return TypeCategory::Boolean,
        "BIT" => return TypeCategory::Bit,
        "DATETIME" | "TIMESTAMP" => return TypeCategory::DateTime,
        "DATE" => return TypeCategory::Date,
        "JSON" => return TypeCategory::Json,
        _ => {}
    }

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if upper.contains("DECIMAL") || upper.contains("NUMERIC") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if upper.contains("INT") || upper == "YEAR" {
        return TypeCategory::Integer;
    }

    if upper.contains("FLOAT") || upper.contains("DOUBLE") || upper == "REAL" {
        return TypeCategory::Float;
    }

    if upper.contains("BLOB") || upper.contains("BINARY") {
        return TypeCategory::Binary;
    }

    // varchar, text, char, time, enum, set, ...
    TypeCategory::Text
}

/// Which conversion hook a statement is decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastHook {
    /// Text-protocol queries
    Query,
    /// Prepared statements
    Execute,
}

/// Which date columns stay as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DateStrings {
    #[default]
    Never,
    Always,
    /// Upper-cased type names, e.g. `DATE`
    Types(Vec<String>),
}

impl DateStrings {
    /// Read the `dateStrings` connection option: `true` or a list of type names.
    pub fn from_option(value: Option<&JsonValue>) -> Self {
        match value {
            Some(JsonValue::Bool(true)) => Self::Always,
            Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("true") => Self::Always,
            Some(JsonValue::Array(types)) => Self::Types(
                types
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_ascii_uppercase)
                    .collect(),
            ),
            _ => Self::Never,
        }
    }

    pub fn keeps(&self, type_name: &str) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Types(types) => types.iter().any(|t| t.eq_ignore_ascii_case(type_name)),
        }
    }
}

/// Decoding options for one statement.
#[derive(Debug, Clone, Copy)]
pub struct TypeCast<'a> {
    pub hook: CastHook,
    pub dates: &'a DateStrings,
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Value helpers
// =============================================================================

/// Binary data as an array of byte values.
pub fn bytes_to_json(bytes: &[u8]) -> JsonValue {
    JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect())
}

/// Text stored in a byte column: the string if it is UTF-8, base64 otherwise.
pub fn text_bytes_to_json(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

fn float_to_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn datetime_millis(v: NaiveDateTime) -> JsonValue {
    JsonValue::from(v.and_utc().timestamp_millis())
}

fn date_millis(v: NaiveDate) -> JsonValue {
    v.and_hms_opt(0, 0, 0)
        .map(datetime_millis)
        .unwrap_or(JsonValue::Null)
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to JSON objects.
pub trait RowToJson {
    fn to_json_row(&self, cast: TypeCast<'_>) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_row(&self, cast: TypeCast<'_>) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySQL);
                let value = mysql::decode_column(self, idx, type_name, category, cast);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_row(&self, cast: TypeCast<'_>) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::SQLite);
                let value = sqlite::decode_column(self, idx, type_name, category, cast);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
        cast: TypeCast<'_>,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean if cast.hook == CastHook::Query => decode_boolean(row, idx),
            TypeCategory::Boolean => decode_integer(row, idx),
            TypeCategory::Bit => decode_bit(row, idx, cast.hook),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::DateTime | TypeCategory::Date if cast.dates.keeps(type_name) => {
                decode_date_string(row, idx, category)
            }
            TypeCategory::DateTime => decode_datetime(row, idx),
            TypeCategory::Date => decode_date(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Text => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode DECIMAL: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        // Check NULL first
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::from(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return JsonValue::from(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return JsonValue::from(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
            return JsonValue::from(v);
        }
        decode_text(row, idx)
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    /// Single-bit flags read as booleans through the query hook.
    fn decode_bit(row: &MySqlRow, idx: usize, hook: CastHook) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return match (hook, v) {
                (CastHook::Query, 0 | 1) => JsonValue::Bool(v == 1),
                _ => JsonValue::from(v),
            };
        }
        if hook == CastHook::Query {
            if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(idx) {
                return JsonValue::Bool(v);
            }
        }
        decode_binary(row, idx)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_to_json(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_to_json(v as f64);
        }
        JsonValue::Null
    }

    fn decode_datetime(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return v.map(datetime_millis).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return v
                .map(|v| JsonValue::from(v.timestamp_millis()))
                .unwrap_or(JsonValue::Null);
        }
        // Zero dates do not decode.
        JsonValue::Null
    }

    fn decode_date(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(date_millis)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_date_string(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        let text = if category == TypeCategory::Date {
            row.try_get::<Option<NaiveDate>, _>(idx)
                .ok()
                .flatten()
                .map(|d| d.format("%Y-%m-%d").to_string())
        } else {
            row.try_get::<Option<NaiveDateTime>, _>(idx)
                .ok()
                .flatten()
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        };
        text.map(JsonValue::String).unwrap_or(JsonValue::Null)
    }

    fn decode_binary(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| bytes_to_json(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => v.map(JsonValue::String).unwrap_or(JsonValue::Null),
            Err(_) => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| text_bytes_to_json(&v))
                .unwrap_or(JsonValue::Null),
        }
    }
}

mod sqlite {
    use super::*;

    /// SQLite is dynamically typed: the declared type picks dates and
    /// booleans, the stored value's class picks everything else.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
        cast: TypeCast<'_>,
    ) -> JsonValue {
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return JsonValue::Null,
            Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
            Err(_) => return JsonValue::Null,
        };

        match category {
            TypeCategory::DateTime | TypeCategory::Date if !cast.dates.keeps(type_name) => {
                if let Some(v) = decode_date(row, idx) {
                    return v;
                }
            }
            TypeCategory::Boolean if cast.hook == CastHook::Query => {
                if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(idx) {
                    return JsonValue::Bool(v);
                }
            }
            _ => {}
        }

        match storage.as_str() {
            "INTEGER" => row
                .try_get::<i64, _>(idx)
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null),
            "REAL" => row
                .try_get::<f64, _>(idx)
                .map(float_to_json)
                .unwrap_or(JsonValue::Null),
            "BLOB" => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|v| bytes_to_json(&v))
                .unwrap_or(JsonValue::Null),
            _ => decode_text(row, idx, category),
        }
    }

    fn decode_date(row: &SqliteRow, idx: usize) -> Option<JsonValue> {
        if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
            return Some(datetime_millis(v));
        }
        row.try_get::<NaiveDate, _>(idx).ok().map(date_millis)
    }

    fn decode_text(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        let Ok(v) = row.try_get::<String, _>(idx) else {
            return JsonValue::Null;
        };
        if category == TypeCategory::Json {
            if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                return json;
            }
        }
        JsonValue::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_categorize_mysql_types() {
        let db = DatabaseType::MySQL;
        assert_eq!(categorize_type("INT", db), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT UNSIGNED", db), TypeCategory::Integer);
        assert_eq!(categorize_type("BOOLEAN", db), TypeCategory::Boolean);
        assert_eq!(categorize_type("BIT", db), TypeCategory::Bit);
        assert_eq!(categorize_type("DECIMAL", db), TypeCategory::Decimal);
        assert_eq!(categorize_type("DOUBLE", db), TypeCategory::Float);
        assert_eq!(categorize_type("DATETIME", db), TypeCategory::DateTime);
        assert_eq!(categorize_type("TIMESTAMP", db), TypeCategory::DateTime);
        assert_eq!(categorize_type("DATE", db), TypeCategory::Date);
        assert_eq!(categorize_type("MEDIUMBLOB", db), TypeCategory::Binary);
        assert_eq!(categorize_type("VARBINARY", db), TypeCategory::Binary);
        assert_eq!(categorize_type("JSON", db), TypeCategory::Json);
        assert_eq!(categorize_type("VARCHAR", db), TypeCategory::Text);
        assert_eq!(categorize_type("TIME", db), TypeCategory::Text);
    }

    #[test]
    fn test_sqlite_numeric_is_float() {
        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_date_strings_option() {
        assert_eq!(DateStrings::from_option(None), DateStrings::Never);
        assert_eq!(
            DateStrings::from_option(Some(&json!(true))),
            DateStrings::Always
        );
        let only_dates = DateStrings::from_option(Some(&json!(["date"])));
        assert!(only_dates.keeps("DATE"));
        assert!(!only_dates.keeps("DATETIME"));
        assert!(!DateStrings::Never.keeps("DATE"));
    }

    #[test]
    fn test_bytes_to_json() {
        assert_eq!(bytes_to_json(&[1, 2, 255]), json!([1, 2, 255]));
        assert_eq!(bytes_to_json(&[]), json!([]));
    }

    #[test]
    fn test_text_bytes_to_json() {
        assert_eq!(text_bytes_to_json(b"hello"), json!("hello"));
        assert_eq!(text_bytes_to_json(&[0xFF, 0xFE, 0x00, 0x01]), json!("//4AAQ=="));
    }

    #[test]
    fn test_date_millis_is_utc_midnight() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(date_millis(date), json!(1_704_153_600_000i64));
    }
}
