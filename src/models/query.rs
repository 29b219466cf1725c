//! Query-related data models.
//!
//! Parameters arrive as JSON from callers and are converted to [`QueryParam`]
//! for binding. Results come back as a [`QueryResponse`], which the execution
//! core classifies according to the caller's [`QueryKind`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::str::FromStr;

/// A row decoded to a JSON object, in column order.
pub type JsonRow = Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Unsigned values above `i64::MAX`
    UInt(u64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as JSON text
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }

    /// The JSON form used in logs and error messages.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => json!(v),
            Self::UInt(v) => json!(v),
            Self::Float(v) => json!(v),
            Self::String(v) => JsonValue::String(v.clone()),
            Self::Json(v) => v.clone(),
        }
    }
}

impl From<JsonValue> for QueryParam {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::Int(v)
                } else if let Some(v) = n.as_u64() {
                    Self::UInt(v)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            JsonValue::String(v) => Self::String(v),
            other => Self::Json(other),
        }
    }
}

/// Render a parameter list as a JSON array for diagnostics.
pub fn params_to_json(params: &[QueryParam]) -> JsonValue {
    JsonValue::Array(params.iter().map(QueryParam::to_json).collect())
}

/// How a result is handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// The result unchanged
    #[default]
    Raw,
    /// The generated insert id
    Insert,
    /// The number of affected rows
    Update,
    /// The first row
    Single,
    /// The first column of the first row
    Scalar,
}

impl FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "query" => Ok(Self::Raw),
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "single" => Ok(Self::Single),
            "scalar" => Ok(Self::Scalar),
            other => Err(format!("unknown query kind '{other}'")),
        }
    }
}

/// Which pool an operation should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub affected_rows: u64,
    pub insert_id: u64,
}

/// Result of running one SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Rows(Vec<JsonRow>),
    Write(WriteResult),
}

impl QueryResponse {
    /// Number of rows in a row set; zero for write results.
    pub fn row_count(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Write(_) => 0,
        }
    }

    /// The raw JSON form: an array of row objects, or
    /// `{"affectedRows": n, "insertId": id}`.
    pub fn into_json(self) -> JsonValue {
        match self {
            Self::Rows(rows) => JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect()),
            Self::Write(result) => json!({
                "affectedRows": result.affected_rows,
                "insertId": result.insert_id,
            }),
        }
    }
}

/// One normalized statement of a transaction batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_from_json() {
        assert_eq!(QueryParam::from(json!(null)), QueryParam::Null);
        assert_eq!(QueryParam::from(json!(5)), QueryParam::Int(5));
        assert_eq!(QueryParam::from(json!(u64::MAX)), QueryParam::UInt(u64::MAX));
        assert_eq!(QueryParam::from(json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(QueryParam::from(json!("a")), QueryParam::String("a".into()));
        assert_eq!(
            QueryParam::from(json!({"x": 1})),
            QueryParam::Json(json!({"x": 1}))
        );
    }

    #[test]
    fn test_query_kind_from_str() {
        assert_eq!("scalar".parse::<QueryKind>().unwrap(), QueryKind::Scalar);
        assert_eq!("INSERT".parse::<QueryKind>().unwrap(), QueryKind::Insert);
        assert!("bogus".parse::<QueryKind>().is_err());
    }

    #[test]
    fn test_write_result_json() {
        let response = QueryResponse::Write(WriteResult {
            affected_rows: 2,
            insert_id: 7,
        });
        assert_eq!(response.into_json(), json!({"affectedRows": 2, "insertId": 7}));
    }
}
