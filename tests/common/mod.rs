//! Shared setup for the SQLite-backed integration tests.

#![allow(dead_code)]

use kjmysql::config::{PoolOptions, SettingsHandle};
use kjmysql::db::PoolManager;
use kjmysql::{Exports, Logger, QueryLogger};
use serde_json::{Value as JsonValue, json};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Logger sink that keeps every message for assertions.
#[derive(Default)]
pub struct RecordingLogger {
    pub logs: Mutex<Vec<String>>,
    pub warnings: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl Logger for RecordingLogger {
    fn log(&self, message: &str) {
        self.logs.lock().unwrap().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

impl RecordingLogger {
    pub fn warnings_containing(&self, needle: &str) -> usize {
        self.warnings
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.contains(needle))
            .count()
    }
}

pub struct TestDb {
    // keeps the database file alive for the test
    pub file: NamedTempFile,
    pub exports: Arc<Exports>,
    pub logs: Arc<RecordingLogger>,
}

impl TestDb {
    pub async fn count(&self, table: &str) -> JsonValue {
        self.exports
            .scalar("test", &format!("SELECT COUNT(*) AS n FROM {table}"), &JsonValue::Null)
            .await
            .unwrap()
    }
}

pub async fn setup() -> TestDb {
    setup_with(PoolOptions::default()).await
}

pub async fn setup_with(options: PoolOptions) -> TestDb {
    let file = NamedTempFile::new().unwrap();
    let logger = Arc::new(QueryLogger::new(SettingsHandle::default()));
    let logs = Arc::new(RecordingLogger::default());
    logger.set_logger(logs.clone());

    let pools = PoolManager::new(
        &format!("sqlite://{}", file.path().display()),
        None,
        options,
        logger,
    )
    .unwrap();
    let exports = Arc::new(Exports::new(Arc::new(pools)));
    exports.start();
    assert!(exports.await_connection().await.unwrap());

    TestDb {
        file,
        exports,
        logs,
    }
}

/// A `users` table with three rows.
pub async fn seed_users(db: &TestDb) {
    db.exports
        .query(
            "test",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score INTEGER)",
            &JsonValue::Null,
        )
        .await
        .unwrap();
    db.exports
        .raw_execute(
            "test",
            "INSERT INTO users (name, score) VALUES (?, ?)",
            &json!([["alice", 10], ["bob", 20], ["carol", 30]]),
        )
        .await
        .unwrap();
}
