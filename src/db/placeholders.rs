//! Parameter normalization.
//!
//! Callers pass parameters as JSON in several conventions: positional
//! arrays, named objects, batches of rows, and transaction lists. This module
//! turns each of them into the positional `(sql, params)` form the driver
//! binds, validating counts before any connection is acquired.

use crate::error::{DbError, DbResult};
use crate::models::{Intent, QueryKind, QueryParam, Statement};
use serde_json::{Map, Value as JsonValue};

/// Rewrites named placeholders into positional ones.
pub trait PlaceholderTranslator: Send + Sync {
    /// Returns positional SQL plus the values in placeholder order.
    fn translate(
        &self,
        sql: &str,
        params: &Map<String, JsonValue>,
    ) -> DbResult<(String, Vec<JsonValue>)>;
}

/// Default translator for `:name` and `@name` placeholders.
///
/// Quoted text, `@@system` variables and `::` casts are left alone, as are
/// names the parameter object does not contain.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamedPlaceholders;

impl PlaceholderTranslator for NamedPlaceholders {
    fn translate(
        &self,
        sql: &str,
        params: &Map<String, JsonValue>,
    ) -> DbResult<(String, Vec<JsonValue>)> {
        let chars: Vec<char> = sql.chars().collect();
        let mut out = String::with_capacity(sql.len());
        let mut values = Vec::new();
        let mut quote: Option<char> = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                out.push(c);
                if c == '\\' && i + 1 < chars.len() {
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if c == q {
                    quote = None;
                }
                i += 1;
                continue;
            }

            match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                    i += 1;
                }
                ':' | '@' if chars.get(i + 1) == Some(&c) => {
                    out.push(c);
                    out.push(c);
                    i += 2;
                }
                ':' | '@' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    let value = (!name.is_empty())
                        .then(|| {
                            params
                                .get(&name)
                                .or_else(|| params.get(&format!("{c}{name}")))
                        })
                        .flatten();
                    match value {
                        Some(value) => {
                            out.push('?');
                            values.push(value.clone());
                            i = end;
                        }
                        None => {
                            out.push(c);
                            i += 1;
                        }
                    }
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        Ok((out, values))
    }
}

/// Count positional placeholders.
///
/// A `??` pair is an escape, not a placeholder. `?` inside quoted text or a
/// comment (`-- `, `#`, `/* */`) does not count.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                if chars.peek().is_none_or(|c| c.is_whitespace()) {
                    skip_line(&mut chars);
                }
            }
            '#' => skip_line(&mut chars),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '?' if chars.peek() == Some(&'?') => {
                chars.next();
            }
            '?' => count += 1,
            _ => {}
        }
    }
    count
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    for c in chars.by_ref() {
        if c == '\n' {
            break;
        }
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Normalize one query's parameters.
///
/// Named objects go through `translator` when the SQL looks like it uses
/// named placeholders. Short arrays are padded with nulls; long arrays are
/// rejected.
pub fn parse_arguments(
    sql: &str,
    params: &JsonValue,
    translator: Option<&dyn PlaceholderTranslator>,
) -> DbResult<(String, Vec<QueryParam>)> {
    let mut sql = sql.to_string();
    let mut values = match params {
        JsonValue::Null => Some(Vec::new()),
        JsonValue::Array(values) => Some(values.clone()),
        _ => None,
    };

    if let (JsonValue::Object(named), Some(translator)) = (params, translator) {
        if sql.contains(':') || sql.contains('@') {
            let (translated, ordered) = translator.translate(&sql, named)?;
            sql = translated;
            values = Some(ordered);
        }
    }

    let expected = count_placeholders(&sql);
    let Some(mut values) = values else {
        if expected > 0 {
            return Err(DbError::parameter_shape(format!(
                "Query has {expected} placeholders (?), but parameters are not an array."
            )));
        }
        return Ok((sql, Vec::new()));
    };

    if values.len() > expected {
        return Err(DbError::parameter_count(expected, values.len()));
    }
    values.resize(expected, JsonValue::Null);

    Ok((sql, values.into_iter().map(QueryParam::from).collect()))
}

/// Split batched-execute parameters into rows.
///
/// Rows are not padded here; see [`pad_row`].
pub fn parse_execute(placeholders: usize, params: &JsonValue) -> DbResult<Vec<Vec<QueryParam>>> {
    match params {
        JsonValue::Null => Ok(vec![Vec::new()]),
        JsonValue::Array(items) if items.is_empty() => Ok(vec![Vec::new()]),
        JsonValue::Array(items) if items[0].is_array() => items
            .iter()
            .map(|row| match row {
                JsonValue::Array(row) => Ok(row.iter().cloned().map(QueryParam::from).collect()),
                other => Err(DbError::parameter_shape(format!(
                    "Batched parameters must all be arrays, received '{}'.",
                    json_type_name(other)
                ))),
            })
            .collect(),
        JsonValue::Array(row) => Ok(vec![row.iter().cloned().map(QueryParam::from).collect()]),
        JsonValue::Object(named) if named.is_empty() => Ok(vec![Vec::new()]),
        JsonValue::Object(named) => Ok(vec![
            (1..=placeholders)
                .map(|i| {
                    named
                        .get(&i.to_string())
                        .cloned()
                        .unwrap_or(JsonValue::Null)
                        .into()
                })
                .collect(),
        ]),
        other => Err(DbError::parameter_shape(format!(
            "Execute parameters must be an array or object, received '{}'.",
            json_type_name(other)
        ))),
    }
}

/// Pad a row with nulls up to the placeholder count. Longer rows are left
/// as they are.
pub fn pad_row(row: &mut Vec<QueryParam>, placeholders: usize) {
    if row.len() < placeholders {
        row.resize(placeholders, QueryParam::Null);
    }
}

/// Normalize a transaction batch.
///
/// Accepts a list whose items are bare SQL strings (using `default_params`),
/// `[sql, params]` pairs, or `{query, values}` / `{query, parameters}`
/// objects.
pub fn parse_transaction(
    queries: &JsonValue,
    default_params: &JsonValue,
    translator: Option<&dyn PlaceholderTranslator>,
) -> DbResult<Vec<Statement>> {
    let JsonValue::Array(items) = queries else {
        return Err(DbError::transaction_shape(format!(
            "Transaction queries must be an array, received '{}'.",
            json_type_name(queries)
        )));
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let (sql, params) = match item {
                JsonValue::String(sql) => (sql.as_str(), default_params),
                JsonValue::Array(pair) => match pair.as_slice() {
                    [JsonValue::String(sql)] => (sql.as_str(), &JsonValue::Null),
                    [JsonValue::String(sql), params] => (sql.as_str(), params),
                    _ => return Err(malformed_statement(index, item)),
                },
                JsonValue::Object(obj) => {
                    let Some(sql) = obj.get("query").and_then(JsonValue::as_str) else {
                        return Err(malformed_statement(index, item));
                    };
                    let params = obj
                        .get("values")
                        .or_else(|| obj.get("parameters"))
                        .unwrap_or(&JsonValue::Null);
                    (sql, params)
                }
                _ => return Err(malformed_statement(index, item)),
            };
            let (sql, params) = parse_arguments(sql, params, translator)?;
            Ok(Statement { sql, params })
        })
        .collect()
}

fn malformed_statement(index: usize, item: &JsonValue) -> DbError {
    DbError::transaction_shape(format!(
        "Transaction query {index} must be a string, [query, params] or {{query, values}}, received '{}'.",
        json_type_name(item)
    ))
}

/// The first keyword of a statement, uppercased.
pub fn leading_keyword(sql: &str) -> String {
    sql.trim_start()
        .trim_start_matches('(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Result classification for batched execute, from the leading keyword.
pub fn execute_type(sql: &str) -> QueryKind {
    match leading_keyword(sql).as_str() {
        "INSERT" => QueryKind::Insert,
        "UPDATE" | "DELETE" => QueryKind::Update,
        _ => QueryKind::Raw,
    }
}

/// Only plain `SELECT` text may run on the read pool.
pub fn statement_intent(sql: &str) -> Intent {
    if leading_keyword(sql) == "SELECT" {
        Intent::Read
    } else {
        Intent::Write
    }
}

/// Whether an empty result should still be treated as a row set.
pub fn returns_rows(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "WITH" | "VALUES" | "TABLE" | "PRAGMA"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use serde_json::json;

    fn ints(params: &[QueryParam]) -> Vec<Option<i64>> {
        params
            .iter()
            .map(|p| match p {
                QueryParam::Int(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_count_placeholders() {
        assert_eq!(count_placeholders("SELECT 1"), 0);
        assert_eq!(count_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"), 2);
        assert_eq!(count_placeholders("SELECT ?? FROM t WHERE a = ?"), 1);
        assert_eq!(count_placeholders("SELECT '?' , \"?\" FROM t WHERE a = ?"), 1);
        assert_eq!(count_placeholders(r"SELECT 'it\'s ?' WHERE a = ?"), 1);
    }

    #[test]
    fn test_count_placeholders_skips_comments() {
        let sql = "-- why is this here?\nSELECT a FROM t # don't count ?\nWHERE b = ? /* or ? */";
        assert_eq!(count_placeholders(sql), 1);
        assert_eq!(count_placeholders("SELECT 5--?\n"), 1);
        assert_eq!(count_placeholders("SELECT 1 --"), 0);
    }

    #[test]
    fn test_pads_short_params() {
        let (sql, params) =
            parse_arguments("INSERT INTO t VALUES (?, ?, ?)", &json!([1]), None).unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES (?, ?, ?)");
        assert_eq!(
            params,
            vec![QueryParam::Int(1), QueryParam::Null, QueryParam::Null]
        );
    }

    #[test]
    fn test_rejects_long_params() {
        let err = parse_arguments("SELECT ?", &json!([1, 2]), None).unwrap_err();
        assert!(matches!(
            err,
            DbError::ParameterCount {
                expected: 1,
                received: 2
            }
        ));
    }

    #[test]
    fn test_padding_never_reorders() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let placeholders = rng.gen_range(0..12);
            let supplied = rng.gen_range(0..=placeholders);
            let values: Vec<i64> = (0..supplied).map(|_| rng.gen_range(-1000..1000)).collect();
            let sql = format!("SELECT {}", vec!["?"; placeholders].join(", "));

            let (_, params) = parse_arguments(&sql, &json!(values), None).unwrap();
            assert_eq!(params.len(), placeholders);
            let got = ints(&params);
            for (i, v) in values.iter().enumerate() {
                assert_eq!(got[i], Some(*v));
            }
            assert!(params[supplied..].iter().all(QueryParam::is_null));

            let mut too_many = values.clone();
            too_many.push(1);
            too_many.extend((0..rng.gen_range(0..3)).map(|_| 0));
            if too_many.len() > placeholders {
                assert!(matches!(
                    parse_arguments(&sql, &json!(too_many), None),
                    Err(DbError::ParameterCount { .. })
                ));
            }
        }
    }

    #[test]
    fn test_object_params_without_translator() {
        let err = parse_arguments("SELECT * FROM t WHERE a = ?", &json!({"a": 1}), None)
            .unwrap_err();
        assert!(matches!(err, DbError::ParameterShape { .. }));

        let (_, params) = parse_arguments("SELECT 1", &json!({"a": 1}), None).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_named_placeholders() {
        let (sql, params) = parse_arguments(
            "UPDATE users SET name = :name WHERE id = @id AND note != ':name'",
            &json!({"id": 4, "name": "kj"}),
            Some(&NamedPlaceholders),
        )
        .unwrap();
        assert_eq!(sql, "UPDATE users SET name = ? WHERE id = ? AND note != ':name'");
        assert_eq!(
            params,
            vec![QueryParam::String("kj".into()), QueryParam::Int(4)]
        );
    }

    #[test]
    fn test_named_placeholders_skip_system_vars_and_unknown_names() {
        let (sql, values) = NamedPlaceholders
            .translate(
                "SELECT @@version, :missing, :param0",
                json!({"param0": 1}).as_object().unwrap(),
            )
            .unwrap();
        assert_eq!(sql, "SELECT @@version, :missing, ?");
        assert_eq!(values, vec![json!(1)]);
    }

    #[test]
    fn test_named_placeholder_repeated() {
        let (sql, values) = NamedPlaceholders
            .translate(
                "SELECT :a + :a",
                json!({"a": 2}).as_object().unwrap(),
            )
            .unwrap();
        assert_eq!(sql, "SELECT ? + ?");
        assert_eq!(values, vec![json!(2), json!(2)]);
    }

    #[test]
    fn test_parse_execute_shapes() {
        assert_eq!(parse_execute(2, &JsonValue::Null).unwrap(), vec![vec![]]);
        assert_eq!(parse_execute(2, &json!([])).unwrap(), vec![vec![]]);

        let rows = parse_execute(2, &json!([[1, 2], [3]])).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![QueryParam::Int(3)]);

        let rows = parse_execute(2, &json!([1, 2])).unwrap();
        assert_eq!(rows, vec![vec![QueryParam::Int(1), QueryParam::Int(2)]]);

        let rows = parse_execute(3, &json!({"1": "a", "3": "c"})).unwrap();
        assert_eq!(
            rows,
            vec![vec![
                QueryParam::String("a".into()),
                QueryParam::Null,
                QueryParam::String("c".into())
            ]]
        );

        assert!(matches!(
            parse_execute(1, &json!([[1], 2])),
            Err(DbError::ParameterShape { .. })
        ));
        assert!(matches!(
            parse_execute(1, &json!("x")),
            Err(DbError::ParameterShape { .. })
        ));
    }

    #[test]
    fn test_pad_row_never_truncates() {
        let mut row = vec![QueryParam::Int(1)];
        pad_row(&mut row, 3);
        assert_eq!(row.len(), 3);

        let mut row = vec![QueryParam::Int(1), QueryParam::Int(2)];
        pad_row(&mut row, 1);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_parse_transaction_shapes() {
        let statements = parse_transaction(
            &json!([
                "INSERT INTO t VALUES (?)",
                ["UPDATE t SET a = ?", [5]],
                {"query": "DELETE FROM t WHERE a = ?", "values": [6]},
                {"query": "DELETE FROM t WHERE b = ?", "parameters": [7]}
            ]),
            &json!([1]),
            None,
        )
        .unwrap();

        let params: Vec<Vec<QueryParam>> = statements.iter().map(|s| s.params.clone()).collect();
        assert_eq!(
            params,
            vec![
                vec![QueryParam::Int(1)],
                vec![QueryParam::Int(5)],
                vec![QueryParam::Int(6)],
                vec![QueryParam::Int(7)],
            ]
        );
    }

    #[test]
    fn test_parse_transaction_rejects_non_list() {
        let err = parse_transaction(&json!("INSERT INTO t VALUES (1)"), &JsonValue::Null, None)
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionShape { .. }));
        assert!(err.to_string().contains("received 'string'"));

        let err = parse_transaction(&json!([42]), &JsonValue::Null, None).unwrap_err();
        assert!(matches!(err, DbError::TransactionShape { .. }));
    }

    #[test]
    fn test_parse_transaction_propagates_count_errors() {
        let err = parse_transaction(&json!([["SELECT ?", [1, 2]]]), &JsonValue::Null, None)
            .unwrap_err();
        assert!(matches!(err, DbError::ParameterCount { .. }));
    }

    #[test]
    fn test_execute_type_and_intent() {
        assert_eq!(execute_type("INSERT INTO t VALUES (?)"), QueryKind::Insert);
        assert_eq!(execute_type("  update t set a = 1"), QueryKind::Update);
        assert_eq!(execute_type("DELETE FROM t"), QueryKind::Update);
        assert_eq!(execute_type("REPLACE INTO t VALUES (1)"), QueryKind::Raw);
        assert_eq!(statement_intent("select 1"), Intent::Read);
        assert_eq!(statement_intent("(SELECT 1) UNION (SELECT 2)"), Intent::Read);
        assert_eq!(statement_intent("INSERT INTO t SELECT 1"), Intent::Write);
        assert!(returns_rows("SHOW TABLES"));
        assert!(!returns_rows("UPDATE t SET a = 1"));
    }
}
