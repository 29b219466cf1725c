//! Integration tests for the migration runner.

mod common;

use common::setup;
use futures_util::future::BoxFuture;
use kjmysql::DbError;
use kjmysql::db::{Migration, MigrationExecutor, RegisteredMigrations};
use kjmysql::error::DbResult;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tempfile::tempdir;

struct SeedPlayers;

impl Migration for SeedPlayers {
    fn up<'a>(&'a self, db: &'a MigrationExecutor) -> BoxFuture<'a, DbResult<()>> {
        Box::pin(async move {
            db.execute("INSERT INTO players (name) VALUES (?)", &json!(["admin"]))
                .await?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_missing_directory_is_nothing_to_do() {
    let db = setup().await;
    let report = db
        .exports
        .run_migrations("shop", "/nonexistent/kjmysql/migrations")
        .await
        .unwrap();
    assert!(report.applied.is_empty());
}

#[tokio::test]
async fn test_only_new_files_run_in_lexical_order() {
    let db = setup().await;
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("001_a.sql"), "CREATE TABLE a (id INTEGER);").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a migration").unwrap();

    let first = db.exports.run_migrations("shop", dir.path()).await.unwrap();
    assert_eq!(first.applied, vec!["001_a.sql"]);

    std::fs::write(dir.path().join("000_b.sql"), "CREATE TABLE b (id INTEGER);").unwrap();
    std::fs::write(
        dir.path().join("002_c.sql"),
        "CREATE TABLE c (id INTEGER);\nINSERT INTO c (id) VALUES (1);",
    )
    .unwrap();

    let second = db.exports.run_migrations("shop", dir.path()).await.unwrap();
    assert_eq!(second.applied, vec!["000_b.sql", "002_c.sql"]);
    assert_eq!(db.count("c").await, json!(1));

    let third = db.exports.run_migrations("shop", dir.path()).await.unwrap();
    assert!(third.applied.is_empty());

    // the ledger is per resource
    let other = db.exports.run_migrations("garage", dir.path()).await;
    assert!(other.is_err());
}

#[tokio::test]
async fn test_commented_sql_file_runs_as_plain_text() {
    let db = setup().await;
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("001_shop.sql"),
        "-- why is this here? don't ask\n\
         CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);\n\
         /* seed row, price ? later */\n\
         INSERT INTO items (name) VALUES ('bread');\n\
         CREATE TABLE prices (item_id INTEGER);\n",
    )
    .unwrap();

    let report = db.exports.run_migrations("shop", dir.path()).await.unwrap();
    assert_eq!(report.applied, vec!["001_shop.sql"]);
    assert_eq!(db.count("items").await, json!(1));
    assert_eq!(db.count("prices").await, json!(0));
    assert!(db.logs.errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_halts_remaining_files() {
    let db = setup().await;
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("001_ok.sql"), "CREATE TABLE ok (id INTEGER);").unwrap();
    std::fs::write(dir.path().join("002_bad.sql"), "CREATE TABL broken (id INTEGER);").unwrap();
    std::fs::write(dir.path().join("003_next.sql"), "CREATE TABLE next (id INTEGER);").unwrap();

    let err = db
        .exports
        .run_migrations("shop", dir.path())
        .await
        .unwrap_err();
    match err {
        DbError::Migration {
            resource,
            migration,
            ..
        } => {
            assert_eq!(resource, "shop");
            assert_eq!(migration, "002_bad.sql");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let ledger = db
        .exports
        .query(
            "test",
            "SELECT migration FROM _kjmysql_migrations WHERE resource = ? ORDER BY migration",
            &json!(["shop"]),
        )
        .await
        .unwrap();
    assert_eq!(ledger, json!([{"migration": "001_ok.sql"}]));
    assert_eq!(db.logs.errors.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_registered_migration_runs_after_sql() {
    let db = setup().await;
    db.exports
        .set_migration_loader(Arc::new(
            RegisteredMigrations::new().register("002_seed.rs", Arc::new(SeedPlayers)),
        ))
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("001_players.sql"),
        "CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT);",
    )
    .unwrap();
    std::fs::write(dir.path().join("002_seed.rs"), "").unwrap();
    std::fs::write(dir.path().join("mod.rs"), "").unwrap();

    let report = db.exports.run_migrations("shop", dir.path()).await.unwrap();
    assert_eq!(report.applied, vec!["001_players.sql", "002_seed.rs"]);

    let name = db
        .exports
        .scalar("test", "SELECT name FROM players", &JsonValue::Null)
        .await
        .unwrap();
    assert_eq!(name, json!("admin"));
}
