//! Migration runner.
//!
//! Each resource keeps a directory of migration files. Files not yet in the
//! `_kjmysql_migrations` ledger are applied in lexical order, each recorded
//! right after it succeeds. `.sql` files run as multi-statement text;
//! executable migrations are [`Migration`] implementations resolved through
//! a [`MigrationLoader`].

use crate::db::placeholders::parse_arguments;
use crate::db::pool::PoolManager;
use crate::error::{DbError, DbResult};
use crate::logger::QueryLogger;
use crate::models::{DatabaseType, Intent, QueryResponse};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const MIGRATIONS_TABLE: &str = "_kjmysql_migrations";

const MYSQL_LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS `_kjmysql_migrations` (
  `id` INT NOT NULL AUTO_INCREMENT,
  `resource` VARCHAR(128) NOT NULL,
  `migration` VARCHAR(255) NOT NULL,
  `run_at` TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
  PRIMARY KEY (`id`),
  UNIQUE INDEX `idx_resource_migration` (`resource`, `migration`)
) ENGINE=InnoDB";

const SQLITE_LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS `_kjmysql_migrations` (
  `id` INTEGER PRIMARY KEY AUTOINCREMENT,
  `resource` TEXT NOT NULL,
  `migration` TEXT NOT NULL,
  `run_at` TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE UNIQUE INDEX IF NOT EXISTS `idx_resource_migration`
  ON `_kjmysql_migrations` (`resource`, `migration`)";

/// Query access handed to executable migrations. Always the primary pool.
#[derive(Debug, Clone)]
pub struct MigrationExecutor {
    pools: Arc<PoolManager>,
}

impl MigrationExecutor {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pools.primary_options().db_type
    }

    /// Run multi-statement SQL text as is, with no parameters.
    pub async fn run_script(&self, sql: &str) -> DbResult<()> {
        let mut conn = self.pools.acquire(Intent::Write).await?;
        let result = conn.query(sql, &[]).await;
        conn.release().await;
        result.map(|_| ())
    }

    /// Run SQL with positional parameters and return the raw result.
    pub async fn query(&self, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        let (sql, values) = parse_arguments(sql, params, None)?;
        let mut conn = self.pools.acquire(Intent::Write).await?;
        let result = conn.query(&sql, &values).await;
        conn.release().await;
        result.map(QueryResponse::into_json)
    }

    /// Same as [`query`](Self::query) as a prepared statement.
    pub async fn execute(&self, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        let (sql, values) = parse_arguments(sql, params, None)?;
        let mut conn = self.pools.acquire(Intent::Write).await?;
        let result = conn.execute(&sql, &values).await;
        conn.release().await;
        result.map(QueryResponse::into_json)
    }
}

/// An executable migration.
pub trait Migration: Send + Sync {
    fn up<'a>(&'a self, db: &'a MigrationExecutor) -> BoxFuture<'a, DbResult<()>>;
}

/// Resolves executable migration files to [`Migration`] units.
pub trait MigrationLoader: Send + Sync {
    /// Whether `file_name` is an executable migration for this loader.
    fn handles(&self, file_name: &str) -> bool;

    fn load(&self, path: &Path) -> DbResult<Arc<dyn Migration>>;
}

/// Compiled-in migrations keyed by `.rs` file name.
///
/// `mod.rs` and `lib.rs` only declare modules and are never treated as
/// migrations.
#[derive(Default, Clone)]
pub struct RegisteredMigrations {
    migrations: HashMap<String, Arc<dyn Migration>>,
}

impl std::fmt::Debug for RegisteredMigrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.migrations.keys().collect();
        names.sort();
        f.debug_struct("RegisteredMigrations")
            .field("migrations", &names)
            .finish()
    }
}

impl RegisteredMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, file_name: impl Into<String>, migration: Arc<dyn Migration>) -> Self {
        self.migrations.insert(file_name.into(), migration);
        self
    }
}

impl MigrationLoader for RegisteredMigrations {
    fn handles(&self, file_name: &str) -> bool {
        file_name.ends_with(".rs") && file_name != "mod.rs" && file_name != "lib.rs"
    }

    fn load(&self, path: &Path) -> DbResult<Arc<dyn Migration>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.migrations.get(file_name).cloned().ok_or_else(|| {
            DbError::invalid_input(format!(
                "Migration file {file_name} has no registered up() implementation"
            ))
        })
    }
}

/// Outcome of one [`MigrationRunner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub resource: String,
    /// Files applied by this run, in order.
    pub applied: Vec<String>,
}

pub struct MigrationRunner {
    pools: Arc<PoolManager>,
    loader: Arc<dyn MigrationLoader>,
    logger: Arc<QueryLogger>,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner").finish_non_exhaustive()
    }
}

impl MigrationRunner {
    pub fn new(pools: Arc<PoolManager>, loader: Arc<dyn MigrationLoader>) -> Self {
        let logger = Arc::clone(pools.logger());
        Self {
            pools,
            loader,
            logger,
        }
    }

    pub fn set_loader(&mut self, loader: Arc<dyn MigrationLoader>) {
        self.loader = loader;
    }

    fn executor(&self) -> MigrationExecutor {
        MigrationExecutor::new(Arc::clone(&self.pools))
    }

    /// Apply every new migration in `path` for `resource`.
    ///
    /// A missing directory means there is nothing to do. A failing file
    /// stops the run; files before it stay applied.
    pub async fn run(&self, resource: &str, path: impl AsRef<Path>) -> DbResult<MigrationReport> {
        let path = path.as_ref();
        if !self.pools.is_ready() {
            self.logger.log(&format!(
                "[kjmysql] [{resource}] Waiting for database pool to be ready for migrations..."
            ));
        }
        self.pools.await_ready().await?;

        let db = self.executor();
        self.ensure_ledger(&db).await.map_err(|e| {
            self.logger.error(&format!(
                "[kjmysql] FAILED to create migrations table. Migrations will not run. Error: {e}"
            ));
            DbError::migration(resource, MIGRATIONS_TABLE, e.to_string())
        })?;

        let mut report = MigrationReport {
            resource: resource.to_string(),
            applied: Vec::new(),
        };

        let pending = match self.pending_files(&db, resource, path).await {
            Ok(Some(files)) => files,
            Ok(None) => {
                self.logger.log(&format!(
                    "[kjmysql] [{resource}] No migrations folder found at {}. Skipping.",
                    path.display()
                ));
                return Ok(report);
            }
            Err(e) => return Err(self.failed(resource, "", e)),
        };

        if pending.is_empty() {
            self.logger
                .log(&format!("[kjmysql] [{resource}] Database schema is up to date."));
            return Ok(report);
        }

        self.logger.log(&format!(
            "[kjmysql] [{resource}] Found {} new migration(s) to run.",
            pending.len()
        ));

        for file in pending {
            self.logger
                .log(&format!("[kjmysql] [{resource}] Running migration: {file}..."));
            if let Err(e) = self.apply(&db, resource, path, &file).await {
                return Err(self.failed(resource, &file, e));
            }
            self.logger
                .log(&format!("[kjmysql] [{resource}] Successfully ran {file}."));
            report.applied.push(file);
        }

        self.logger.log(&format!(
            "[kjmysql] [{resource}] All migrations completed successfully."
        ));
        Ok(report)
    }

    async fn ensure_ledger(&self, db: &MigrationExecutor) -> DbResult<()> {
        let ddl = match db.db_type() {
            DatabaseType::MySQL => MYSQL_LEDGER_DDL,
            DatabaseType::SQLite => SQLITE_LEDGER_DDL,
        };
        db.run_script(ddl).await
    }

    /// New migration files in lexical order, or `None` when the directory
    /// does not exist.
    async fn pending_files(
        &self,
        db: &MigrationExecutor,
        resource: &str,
        path: &Path,
    ) -> DbResult<Option<Vec<String>>> {
        let rows = db
            .query(
                "SELECT `migration` FROM `_kjmysql_migrations` WHERE `resource` = ?",
                &json!([resource]),
            )
            .await?;
        let applied: HashSet<String> = rows
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("migration").and_then(JsonValue::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut dir = match tokio::fs::read_dir(path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DbError::invalid_input(format!(
                    "Unable to read {}: {e}",
                    path.display()
                )));
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| {
            DbError::invalid_input(format!("Unable to read {}: {e}", path.display()))
        })? {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let runnable = name.ends_with(".sql") || self.loader.handles(&name);
            if runnable && !applied.contains(&name) {
                files.push(name);
            }
        }
        files.sort();
        debug!(resource = %resource, pending = files.len(), "Resolved pending migrations");
        Ok(Some(files))
    }

    async fn apply(
        &self,
        db: &MigrationExecutor,
        resource: &str,
        dir: &Path,
        file: &str,
    ) -> DbResult<()> {
        let path = dir.join(file);
        if file.ends_with(".sql") {
            let sql = tokio::fs::read_to_string(&path).await.map_err(|e| {
                DbError::invalid_input(format!("Unable to read {}: {e}", path.display()))
            })?;
            db.run_script(&sql).await?;
        } else {
            let migration = self.loader.load(&path)?;
            migration.up(db).await?;
        }

        db.query(
            "INSERT INTO `_kjmysql_migrations` (`resource`, `migration`) VALUES (?, ?)",
            &json!([resource, file]),
        )
        .await?;
        Ok(())
    }

    fn failed(&self, resource: &str, file: &str, err: DbError) -> DbError {
        self.logger.error(&format!(
            "[kjmysql] [{resource}] FAILED to run migrations. Error: {err}"
        ));
        self.logger.error(&format!(
            "[kjmysql] [{resource}] Please check your migration files for errors. No further migrations for this resource will be run until this is fixed."
        ));
        DbError::migration(resource, file, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_loader_skips_declaration_files() {
        let loader = RegisteredMigrations::new();
        assert!(loader.handles("002_seed.rs"));
        assert!(!loader.handles("mod.rs"));
        assert!(!loader.handles("lib.rs"));
        assert!(!loader.handles("001_init.sql"));
    }

    #[test]
    fn test_unregistered_file_fails_to_load() {
        let loader = RegisteredMigrations::new();
        let err = loader.load(Path::new("/m/003_missing.rs")).err().unwrap();
        assert!(err.to_string().contains("003_missing.rs"));
    }
}
