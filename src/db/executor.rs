//! Query execution engine.
//!
//! Every entry point follows the same path: normalize parameters, acquire a
//! guarded connection by read/write intent, optionally enable the profiler,
//! run, classify, log timing, and release. Errors leave through
//! [`QueryLogger::report`] so callers see one message format.
//!
//! # Entry points
//!
//! - [`QueryExecutor::raw_query`]: one statement, classified by [`QueryKind`]
//! - [`QueryExecutor::raw_execute`]: one prepared statement over one or more
//!   parameter rows
//! - [`QueryExecutor::raw_transaction`]: a list of statements, all or nothing
//! - [`QueryExecutor::start_transaction`]: a caller-driven transaction with a
//!   wall-clock limit

use crate::db::connection::GuardedConnection;
use crate::db::placeholders::{
    NamedPlaceholders, PlaceholderTranslator, count_placeholders, execute_type, pad_row,
    parse_arguments, parse_execute, parse_transaction, statement_intent,
};
use crate::db::pool::PoolManager;
use crate::db::profiler::{self, PendingProfiles};
use crate::db::response::classify;
use crate::error::{DbError, DbResult};
use crate::logger::QueryLogger;
use crate::models::{Intent, QueryKind, QueryParam, QueryResponse, Statement, params_to_json};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Label used in place of the SQL text when a transaction fails.
pub const TRANSACTION_FAILED: &str = "Transaction Failed";

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Query executor that handles database query execution.
pub struct QueryExecutor {
    pools: Arc<PoolManager>,
    logger: Arc<QueryLogger>,
    translator: Arc<dyn PlaceholderTranslator>,
    transaction_timeout: Duration,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("pools", &self.pools)
            .field("transaction_timeout", &self.transaction_timeout)
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    /// Create an executor over the given pools with named placeholder
    /// support and the configured transaction timeout.
    pub fn new(pools: Arc<PoolManager>) -> Self {
        let logger = Arc::clone(pools.logger());
        let transaction_timeout = pools.pool_options().transaction_timeout_or_default();
        Self {
            pools,
            logger,
            translator: Arc::new(NamedPlaceholders),
            transaction_timeout,
        }
    }

    /// Replace the named placeholder translator.
    pub fn with_translator(mut self, translator: Arc<dyn PlaceholderTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn logger(&self) -> &Arc<QueryLogger> {
        &self.logger
    }

    fn translator(&self) -> Option<&dyn PlaceholderTranslator> {
        Some(self.translator.as_ref())
    }

    /// Run one statement and classify its result.
    pub async fn raw_query(
        &self,
        kind: QueryKind,
        resource: &str,
        sql: &str,
        params: &JsonValue,
    ) -> DbResult<JsonValue> {
        let (sql, values) = parse_arguments(sql, params, self.translator())
            .map_err(|e| self.logger.report(resource, e, Some(sql), Some(params)))?;

        self.run_query(kind, resource, &sql, &values)
            .await
            .map_err(|e| {
                self.logger
                    .report(resource, e, Some(&sql), Some(&params_to_json(&values)))
            })
    }

    async fn run_query(
        &self,
        kind: QueryKind,
        resource: &str,
        sql: &str,
        values: &[QueryParam],
    ) -> DbResult<JsonValue> {
        let mut conn = self.pools.acquire(statement_intent(sql)).await?;
        let result = self.query_profiled(&mut conn, resource, sql, values).await;
        conn.release().await;

        let response = result?;
        self.logger
            .validate_result_set(resource, sql, response.row_count());
        Ok(classify(kind, response))
    }

    async fn query_profiled(
        &self,
        conn: &mut GuardedConnection,
        resource: &str,
        sql: &str,
        values: &[QueryParam],
    ) -> DbResult<QueryResponse> {
        let profiling = profiler::start(conn, &self.logger).await?;
        let started = Instant::now();
        let response = conn.query(sql, values).await?;

        if profiling {
            if let Some(duration) = profiler::total(conn).await? {
                self.logger.log_query(resource, sql, duration, Some(values));
            }
        } else {
            self.logger
                .log_query(resource, sql, elapsed_ms(started), Some(values));
        }
        Ok(response)
    }

    /// Run one prepared statement for every parameter row.
    ///
    /// The result kind comes from the leading keyword: `INSERT` returns
    /// insert ids, `UPDATE`/`DELETE` affected rows, anything else the raw
    /// result. A single row returns its value directly; several rows
    /// return an array in row order.
    pub async fn raw_execute(
        &self,
        resource: &str,
        sql: &str,
        params: &JsonValue,
    ) -> DbResult<JsonValue> {
        let kind = execute_type(sql);
        let placeholders = count_placeholders(sql);
        let rows = parse_execute(placeholders, params)
            .map_err(|e| self.logger.report(resource, e, Some(sql), Some(params)))?;

        let mut conn = self
            .pools
            .acquire(statement_intent(sql))
            .await
            .map_err(|e| self.logger.report(resource, e, Some(sql), Some(params)))?;
        let result = self
            .execute_rows(&mut conn, kind, resource, sql, placeholders, rows)
            .await;
        conn.release().await;

        let mut results =
            result.map_err(|e| self.logger.report(resource, e, Some(sql), Some(params)))?;
        if results.len() == 1 {
            Ok(results.remove(0))
        } else {
            Ok(JsonValue::Array(results))
        }
    }

    async fn execute_rows(
        &self,
        conn: &mut GuardedConnection,
        kind: QueryKind,
        resource: &str,
        sql: &str,
        placeholders: usize,
        rows: Vec<Vec<QueryParam>>,
    ) -> DbResult<Vec<JsonValue>> {
        let profiling = profiler::start(conn, &self.logger).await?;
        let mut pending = PendingProfiles::default();
        let mut results = Vec::with_capacity(rows.len());

        for mut row in rows {
            pad_row(&mut row, placeholders);

            let started = Instant::now();
            let response = conn.execute(sql, &row).await?;
            self.logger
                .validate_result_set(resource, sql, response.row_count());
            results.push(classify(kind, response));

            if profiling {
                pending.push(sql, &row);
                if pending.is_full() {
                    pending.flush(conn, &self.logger, resource).await?;
                }
            } else {
                self.logger
                    .log_query(resource, sql, elapsed_ms(started), Some(&row));
            }
        }

        if profiling {
            pending.flush(conn, &self.logger, resource).await?;
        }
        Ok(results)
    }

    /// Run a batch of statements in one transaction.
    ///
    /// Any failure rolls back every earlier statement and is reported with
    /// the `Transaction Failed` label.
    pub async fn raw_transaction(
        &self,
        resource: &str,
        queries: &JsonValue,
        params: &JsonValue,
    ) -> DbResult<bool> {
        let statements = parse_transaction(queries, params, self.translator())
            .map_err(|e| self.logger.report(resource, e, None, None))?;
        self.transaction_statements(resource, &statements).await
    }

    /// Same as [`raw_transaction`](Self::raw_transaction) for an already
    /// normalized batch.
    pub async fn transaction_statements(
        &self,
        resource: &str,
        statements: &[Statement],
    ) -> DbResult<bool> {
        let mut conn = self
            .pools
            .acquire(Intent::Write)
            .await
            .map_err(|e| self.logger.report(resource, e, Some(TRANSACTION_FAILED), None))?;

        let result = self.run_statements(&mut conn, resource, statements).await;
        if let Err(e) = result {
            if conn.in_transaction() {
                if let Err(rollback) = conn.rollback().await {
                    self.logger.error(&format!(
                        "{resource} failed to roll back transaction: {rollback}"
                    ));
                }
            }
            conn.release().await;
            return Err(self
                .logger
                .report(resource, e, Some(TRANSACTION_FAILED), None));
        }

        conn.release().await;
        Ok(true)
    }

    async fn run_statements(
        &self,
        conn: &mut GuardedConnection,
        resource: &str,
        statements: &[Statement],
    ) -> DbResult<()> {
        let profiling = profiler::start(conn, &self.logger).await?;
        let mut pending = PendingProfiles::default();

        conn.begin_transaction().await?;
        for statement in statements {
            let started = Instant::now();
            conn.query(&statement.sql, &statement.params).await?;

            if profiling {
                pending.push(&statement.sql, &statement.params);
                if pending.is_full() {
                    pending.flush(conn, &self.logger, resource).await?;
                }
            } else {
                self.logger.log_query(
                    resource,
                    &statement.sql,
                    elapsed_ms(started),
                    Some(&statement.params),
                );
            }
        }
        if profiling {
            pending.flush(conn, &self.logger, resource).await?;
        }

        conn.commit().await
    }

    /// Run a caller-driven transaction.
    ///
    /// `body` receives a [`TransactionScope`] for running queries and
    /// decides the outcome: `Ok(Some(false))` rolls back and returns
    /// `Ok(false)`, any other `Ok` commits and returns `Ok(true)`, and `Err`
    /// rolls back and is reported. Once the transaction timeout elapses the
    /// connection is rolled back and taken away from the scope, and the
    /// transaction fails even if `body` later succeeds.
    pub async fn start_transaction<F, Fut>(&self, resource: &str, body: F) -> DbResult<bool>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = DbResult<Option<bool>>>,
    {
        let report = |e: DbError| self.logger.report(resource, e, Some(TRANSACTION_FAILED), None);

        let mut conn = self.pools.acquire(Intent::Write).await.map_err(report)?;
        if let Err(e) = conn.begin_transaction().await {
            conn.release().await;
            return Err(report(e));
        }

        let id = Uuid::new_v4();
        let slot = Arc::new(Mutex::new(Some(conn)));
        let deadline = Instant::now() + self.transaction_timeout;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        debug!(transaction_id = %id, resource = %resource, "Managed transaction started");

        tokio::spawn(expire_transaction(
            id,
            Arc::clone(&slot),
            deadline,
            cancel_rx,
            resource.to_string(),
            Arc::clone(&self.logger),
        ));

        let scope = TransactionScope {
            id,
            conn: Arc::clone(&slot),
            deadline,
            timeout: self.transaction_timeout,
            translator: Arc::clone(&self.translator),
        };
        let outcome = body(scope).await;
        let _ = cancel_tx.send(());

        let timed_out = Instant::now() >= deadline;
        let taken = slot.lock().await.take();
        let Some(mut conn) = taken else {
            return Err(report(DbError::transaction_timeout(format!(
                "Transaction has timed out after {} seconds.",
                self.transaction_timeout.as_secs()
            ))));
        };

        let result = match outcome {
            _ if timed_out => Err(DbError::transaction_timeout(format!(
                "Transaction has timed out after {} seconds.",
                self.transaction_timeout.as_secs()
            ))),
            Ok(Some(false)) => conn.rollback().await.map(|_| false),
            Ok(_) => conn.commit().await.map(|_| true),
            Err(e) => Err(e),
        };

        if result.is_err() && conn.in_transaction() {
            if let Err(e) = conn.rollback().await {
                self.logger.error(&format!(
                    "{resource} failed to roll back transaction {id}: {e}"
                ));
            }
        }
        conn.release().await;
        debug!(transaction_id = %id, ok = result.is_ok(), "Managed transaction finished");

        result.map_err(report)
    }
}

/// Roll back and release a managed transaction's connection once its
/// deadline passes, unless the transaction finished first.
async fn expire_transaction(
    id: Uuid,
    slot: Arc<Mutex<Option<GuardedConnection>>>,
    deadline: Instant,
    cancel: oneshot::Receiver<()>,
    resource: String,
    logger: Arc<QueryLogger>,
) {
    tokio::select! {
        _ = cancel => {}
        _ = tokio::time::sleep_until(deadline) => {
            let taken = slot.lock().await.take();
            if let Some(mut conn) = taken {
                warn!(transaction_id = %id, resource = %resource, "Managed transaction timed out");
                if let Err(e) = conn.rollback().await {
                    logger.error(&format!(
                        "{resource} failed to roll back timed out transaction {id}: {e}"
                    ));
                }
                conn.release().await;
            }
        }
    }
}

/// Handle for running queries inside [`QueryExecutor::start_transaction`].
#[derive(Clone)]
pub struct TransactionScope {
    id: Uuid,
    conn: Arc<Mutex<Option<GuardedConnection>>>,
    deadline: Instant,
    timeout: Duration,
    translator: Arc<dyn PlaceholderTranslator>,
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl TransactionScope {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run one query in the transaction and return its raw result.
    ///
    /// Failures carry the statement and its parameters in the message.
    pub async fn query(&self, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        let (sql, values) = parse_arguments(sql, params, Some(self.translator.as_ref()))?;
        self.run(&sql, &values)
            .await
            .map(QueryResponse::into_json)
            .map_err(|e| with_statement(e, &sql, &values))
    }

    async fn run(&self, sql: &str, values: &[QueryParam]) -> DbResult<QueryResponse> {
        let expired = || {
            DbError::transaction_timeout(format!(
                "Connection used by transaction timed out after {} seconds.",
                self.timeout.as_secs()
            ))
        };
        if Instant::now() >= self.deadline {
            return Err(expired());
        }
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(expired)?;
        conn.query(sql, values).await
    }
}

/// Prefix an error with the statement that caused it, keeping its kind.
fn with_statement(err: DbError, sql: &str, values: &[QueryParam]) -> DbError {
    let message = format!("Query: {sql}\n{}\n{err}", params_to_json(values));
    match err {
        DbError::TransactionTimeout { .. } => DbError::transaction_timeout(message),
        DbError::QueryExecution { sql_state, .. } => DbError::query_execution(message, sql_state),
        _ => DbError::query_execution(message, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_statement_keeps_timeout_kind() {
        let err = with_statement(
            DbError::transaction_timeout("Connection used by transaction timed out after 30 seconds."),
            "SELECT ?",
            &[QueryParam::Int(1)],
        );
        assert!(matches!(err, DbError::TransactionTimeout { .. }));
        assert_eq!(
            err.to_string(),
            "Query: SELECT ?\n[1]\nConnection used by transaction timed out after 30 seconds."
        );
    }

    #[test]
    fn test_with_statement_keeps_sql_state() {
        let err = with_statement(
            DbError::query_execution("no such table: x", Some("1".into())),
            "SELECT * FROM x",
            &[],
        );
        match err {
            DbError::QueryExecution { message, sql_state } => {
                assert!(message.starts_with("Query: SELECT * FROM x\n[]\n"));
                assert_eq!(sql_state.as_deref(), Some("1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
