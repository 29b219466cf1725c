//! Response classification.

use crate::models::{QueryKind, QueryResponse};
use serde_json::Value as JsonValue;

/// Shape a statement result according to the caller's requested kind.
///
/// | kind   | result                                   |
/// |--------|------------------------------------------|
/// | insert | generated id of a write, else null       |
/// | update | affected rows of a write, else null      |
/// | single | first row, else null                     |
/// | scalar | first column of the first row, else null |
/// | raw    | the result unchanged                     |
pub fn classify(kind: QueryKind, response: QueryResponse) -> JsonValue {
    match (kind, response) {
        (QueryKind::Insert, QueryResponse::Write(w)) => JsonValue::from(w.insert_id),
        (QueryKind::Update, QueryResponse::Write(w)) => JsonValue::from(w.affected_rows),
        (QueryKind::Insert | QueryKind::Update, QueryResponse::Rows(_)) => JsonValue::Null,
        (QueryKind::Single, QueryResponse::Rows(rows)) => rows
            .into_iter()
            .next()
            .map(JsonValue::Object)
            .unwrap_or(JsonValue::Null),
        (QueryKind::Scalar, QueryResponse::Rows(rows)) => rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .map(|(_, value)| value)
            .unwrap_or(JsonValue::Null),
        (QueryKind::Single | QueryKind::Scalar, QueryResponse::Write(_)) => JsonValue::Null,
        (QueryKind::Raw, response) => response.into_json(),
    }
}
