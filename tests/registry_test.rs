//! Integration tests for name-based dispatch and the cached reads.

mod common;

use common::{seed_users, setup};
use kjmysql::exports::{GHMATTI_NAMESPACE, MYSQL_ASYNC_NAMESPACE, NAMESPACE};
use kjmysql::{ExportCall, ExportRegistry};
use serde_json::{Value as JsonValue, json};

#[tokio::test]
async fn test_callback_receives_result_or_error_never_both() {
    let db = setup().await;
    seed_users(&db).await;
    let registry = ExportRegistry::new(db.exports.clone());

    let mut seen = Vec::new();
    registry
        .call_with_callback(
            NAMESPACE,
            "scalar",
            ExportCall::new("shop", vec![json!("SELECT name FROM users WHERE id = ?"), json!([1])]),
            |result, err| seen.push((result, err)),
        )
        .await
        .unwrap();
    assert_eq!(seen, vec![(json!("alice"), None)]);

    let mut seen = Vec::new();
    registry
        .call_with_callback(
            NAMESPACE,
            "query",
            ExportCall::new("shop", vec![json!("SELEC broken"), JsonValue::Null]),
            |result, err| seen.push((result, err)),
        )
        .await
        .unwrap();
    assert_eq!(seen.len(), 1);
    let (result, err) = &seen[0];
    assert!(result.is_null());
    let message = err.as_deref().unwrap();
    assert!(message.starts_with("shop was unable to execute a query!"));
    assert!(message.contains("Query: SELEC broken"));
}

#[tokio::test]
async fn test_async_export_returns_error() {
    let db = setup().await;
    let registry = ExportRegistry::new(db.exports.clone());
    let err = registry
        .call(
            NAMESPACE,
            "query_async",
            ExportCall::new("shop", vec![json!("SELECT ?"), json!([1, 2])]),
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_stored_handle_dispatch() {
    let db = setup().await;
    seed_users(&db).await;
    let registry = ExportRegistry::new(db.exports.clone());

    let handle = registry
        .call(
            NAMESPACE,
            "store_async",
            ExportCall::new("shop", vec![json!("SELECT name FROM users WHERE id = ?")]),
        )
        .await
        .unwrap();
    let name = registry
        .call(
            NAMESPACE,
            "scalar_async",
            ExportCall::new("shop", vec![handle, json!([3])]),
        )
        .await
        .unwrap();
    assert_eq!(name, json!("carol"));

    let err = registry
        .call(
            NAMESPACE,
            "scalar_async",
            ExportCall::new("shop", vec![json!(99), json!([3])]),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No stored query with handle 99"));
}

#[tokio::test]
async fn test_compatibility_aliases() {
    let db = setup().await;
    seed_users(&db).await;
    let registry = ExportRegistry::new(db.exports.clone());

    let mut affected = JsonValue::Null;
    registry
        .call_with_callback(
            MYSQL_ASYNC_NAMESPACE,
            "mysql_execute",
            ExportCall::new("legacy", vec![json!("UPDATE users SET score = 0"), JsonValue::Null]),
            |result, _| affected = result,
        )
        .await
        .unwrap();
    assert_eq!(affected, json!(3));

    let ok = registry
        .call(
            GHMATTI_NAMESPACE,
            "transactionSync",
            ExportCall::new(
                "legacy",
                vec![json!([
                    "DELETE FROM users WHERE id = 1",
                    ["DELETE FROM users WHERE id = ?", [2]]
                ])],
            ),
        )
        .await
        .unwrap();
    assert_eq!(ok, json!(true));

    let rows = registry
        .call(
            GHMATTI_NAMESPACE,
            "executeSync",
            ExportCall::new("legacy", vec![json!("SELECT name FROM users")]),
        )
        .await
        .unwrap();
    assert_eq!(rows, json!([{"name": "carol"}]));
}

#[tokio::test]
async fn test_cached_reads_until_cleared() {
    let db = setup().await;
    seed_users(&db).await;
    let registry = ExportRegistry::new(db.exports.clone());
    let call = || {
        ExportCall::new(
            "shop",
            vec![
                json!("top-score"),
                json!(60),
                json!("SELECT MAX(score) AS top FROM users"),
                JsonValue::Null,
            ],
        )
    };

    let first = registry.call(NAMESPACE, "scalar_cached", call()).await.unwrap();
    assert_eq!(first, json!(30));

    db.exports
        .update("shop", "UPDATE users SET score = 99 WHERE id = 1", &JsonValue::Null)
        .await
        .unwrap();
    let cached = registry.call(NAMESPACE, "scalar_cached", call()).await.unwrap();
    assert_eq!(cached, json!(30));

    let removed = registry
        .call(NAMESPACE, "clearCache", ExportCall::new("shop", vec![json!("top-score")]))
        .await
        .unwrap();
    assert_eq!(removed, json!(1));
    let fresh = registry.call(NAMESPACE, "scalar_cached", call()).await.unwrap();
    assert_eq!(fresh, json!(99));
}

#[tokio::test]
async fn test_readiness_exports() {
    let db = setup().await;
    let registry = ExportRegistry::new(db.exports.clone());
    let ready = registry
        .call(NAMESPACE, "isReady", ExportCall::default())
        .await
        .unwrap();
    assert_eq!(ready, json!(true));
    let awaited = registry
        .call(NAMESPACE, "awaitConnection", ExportCall::default())
        .await
        .unwrap();
    assert_eq!(awaited, json!(true));
}

#[tokio::test]
async fn test_argument_errors_are_reported_like_query_errors() {
    let db = setup().await;
    let registry = ExportRegistry::new(db.exports.clone());

    let err = registry
        .call(
            NAMESPACE,
            "scalar_async",
            ExportCall::new("shop", vec![json!(42), JsonValue::Null]),
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().starts_with("shop was unable to execute a query!"));
    assert!(err.to_string().contains("No stored query with handle 42"));
    assert_eq!(db.logs.errors.lock().unwrap().len(), 1);

    let mut seen = Vec::new();
    registry
        .call_with_callback(
            NAMESPACE,
            "query",
            ExportCall::new("shop", vec![json!(true), JsonValue::Null]),
            |result, err| seen.push((result, err)),
        )
        .await
        .unwrap();
    let message = seen[0].1.as_deref().unwrap();
    assert!(message.starts_with("shop was unable to execute a query!"));
    // callback callers receive the error instead of the log
    assert_eq!(db.logs.errors.lock().unwrap().len(), 1);
}
