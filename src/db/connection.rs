//! Guarded connections.
//!
//! A [`GuardedConnection`] wraps one pooled connection with a transaction
//! flag. Release it with [`GuardedConnection::release`]; if it is dropped
//! instead, the same cleanup runs on a spawned task.
//!
//! ```ignore
//! let mut conn = pools.acquire(Intent::Write).await?;
//! conn.begin_transaction().await?;
//! conn.execute("UPDATE users SET name = ? WHERE id = ?", &params).await?;
//! conn.commit().await?;
//! conn.release().await;
//! ```

use crate::db::params::{bind_mysql_param, bind_sqlite_param};
use crate::db::placeholders::{leading_keyword, returns_rows};
use crate::db::pool::RawConnection;
use crate::db::types::{CastHook, DateStrings, RowToJson, TypeCast};
use crate::error::{DbError, DbResult};
use crate::logger::QueryLogger;
use crate::models::{DatabaseType, JsonRow, QueryParam, QueryResponse, WriteResult};
use futures_util::TryStreamExt;
use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{Either, Executor, MySql, MySqlConnection, Sqlite, SqliteConnection};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct GuardedConnection {
    id: u64,
    conn: Option<RawConnection>,
    in_transaction: bool,
    logger: Arc<QueryLogger>,
    dates: Arc<DateStrings>,
}

impl std::fmt::Debug for GuardedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction)
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl GuardedConnection {
    pub(crate) fn new(conn: RawConnection, logger: Arc<QueryLogger>, dates: Arc<DateStrings>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            conn: Some(conn),
            in_transaction: false,
            logger,
            dates,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn db_type(&self) -> Option<DatabaseType> {
        self.conn.as_ref().map(RawConnection::db_type)
    }

    fn raw(&mut self) -> DbResult<&mut RawConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::pool_unavailable("Connection has already been released"))
    }

    /// Run SQL with the query cast hook.
    ///
    /// Without parameters the text protocol is used, so several
    /// semicolon-separated statements may run at once.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResponse> {
        let dates = Arc::clone(&self.dates);
        let cast = TypeCast {
            hook: CastHook::Query,
            dates: &dates,
        };
        let prepared = !params.is_empty();
        run(self.raw()?, sql, params, cast, prepared).await
    }

    /// Run SQL as a prepared statement with the execute cast hook.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResponse> {
        let dates = Arc::clone(&self.dates);
        let cast = TypeCast {
            hook: CastHook::Execute,
            dates: &dates,
        };
        run(self.raw()?, sql, params, cast, true).await
    }

    pub async fn begin_transaction(&mut self) -> DbResult<()> {
        let id = self.id;
        begin(self.raw()?).await?;
        debug!(connection_id = id, "Transaction started");
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let id = self.id;
        execute_raw(self.raw()?, "COMMIT").await?;
        debug!(connection_id = id, "Transaction committed");
        self.in_transaction = false;
        Ok(())
    }

    /// Roll back the open transaction. The flag is cleared even when the
    /// rollback itself fails, since the server discards the transaction
    /// when the connection closes.
    pub async fn rollback(&mut self) -> DbResult<()> {
        let id = self.id;
        self.in_transaction = false;
        execute_raw(self.raw()?, "ROLLBACK").await?;
        debug!(connection_id = id, "Transaction rolled back");
        Ok(())
    }

    /// Return the connection to its pool.
    ///
    /// A transaction still open at this point is rolled back first.
    pub async fn release(mut self) {
        if self.in_transaction {
            self.logger.warn(&format!(
                "Transaction for connection {} was not committed or rolled back. Auto-rolling back.",
                self.id
            ));
            if let Err(e) = self.rollback().await {
                self.logger.error(&format!(
                    "Failed to roll back transaction for connection {}: {e}",
                    self.id
                ));
                if let Some(conn) = self.conn.take() {
                    conn.detach();
                }
            }
        }
        self.conn.take();
    }
}

impl Drop for GuardedConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            conn.detach();
            return;
        };

        if !self.in_transaction {
            drop(conn);
            return;
        }

        let id = self.id;
        let logger = Arc::clone(&self.logger);
        handle.spawn(async move {
            logger.warn(&format!(
                "Transaction for connection {id} was not committed or rolled back. Auto-rolling back."
            ));
            if let Err(e) = execute_raw(&mut conn, "ROLLBACK").await {
                logger.error(&format!(
                    "Failed to roll back transaction for connection {id}: {e}"
                ));
                conn.detach();
            }
        });
    }
}

async fn begin(conn: &mut RawConnection) -> DbResult<()> {
    let sql = match conn {
        RawConnection::MySql(_) => "START TRANSACTION",
        RawConnection::SQLite(_) => "BEGIN",
    };
    execute_raw(conn, sql).await
}

// The per-backend helpers return boxed futures with named lifetimes so the
// executor borrow is tied to one concrete lifetime and the result stays
// `Send` for spawned tasks.
fn execute_raw<'a>(conn: &'a mut RawConnection, sql: &'a str) -> BoxFuture<'a, DbResult<()>> {
    Box::pin(async move {
        match conn {
            RawConnection::MySql(c) => {
                let c: &'a mut MySqlConnection = &mut **c;
                Executor::execute(c, sqlx::raw_sql(sql)).await?;
            }
            RawConnection::SQLite(c) => {
                let c: &'a mut SqliteConnection = &mut **c;
                Executor::execute(c, sqlx::raw_sql(sql)).await?;
            }
        }
        Ok(())
    })
}

async fn run(
    conn: &mut RawConnection,
    sql: &str,
    params: &[QueryParam],
    cast: TypeCast<'_>,
    prepared: bool,
) -> DbResult<QueryResponse> {
    let (rows, write) = match conn {
        RawConnection::MySql(c) => mysql::run(c, sql, params, cast, prepared).await?,
        RawConnection::SQLite(c) => sqlite::run(c, sql, params, cast, prepared).await?,
    };

    if !rows.is_empty() || returns_rows(sql) {
        Ok(QueryResponse::Rows(rows))
    } else {
        Ok(QueryResponse::Write(write))
    }
}

mod mysql {
    use super::*;

    pub fn run<'a>(
        conn: &'a mut PoolConnection<MySql>,
        sql: &'a str,
        params: &'a [QueryParam],
        cast: TypeCast<'a>,
        prepared: bool,
    ) -> BoxFuture<'a, DbResult<(Vec<JsonRow>, WriteResult)>> {
        Box::pin(async move {
            let conn: &'a mut MySqlConnection = &mut **conn;
            let mut rows = Vec::new();
            let mut write = WriteResult::default();

            let mut stream = if prepared {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                Executor::fetch_many(conn, query)
            } else {
                Executor::fetch_many(conn, sqlx::raw_sql(sql))
            };

            while let Some(item) = stream.try_next().await? {
                match item {
                    Either::Left(done) => {
                        write.affected_rows += done.rows_affected();
                        if done.last_insert_id() != 0 {
                            write.insert_id = done.last_insert_id();
                        }
                    }
                    Either::Right(row) => rows.push(row.to_json_row(cast)),
                }
            }

            Ok((rows, write))
        })
    }
}

mod sqlite {
    use super::*;

    pub fn run<'a>(
        conn: &'a mut PoolConnection<Sqlite>,
        sql: &'a str,
        params: &'a [QueryParam],
        cast: TypeCast<'a>,
        prepared: bool,
    ) -> BoxFuture<'a, DbResult<(Vec<JsonRow>, WriteResult)>> {
        Box::pin(async move {
            let conn: &'a mut SqliteConnection = &mut **conn;
            let mut rows = Vec::new();
            let mut write = WriteResult::default();
            // last_insert_rowid is connection-wide, so only inserts report it
            let inserts = matches!(leading_keyword(sql).as_str(), "INSERT" | "REPLACE");

            let mut stream = if prepared {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                Executor::fetch_many(conn, query)
            } else {
                Executor::fetch_many(conn, sqlx::raw_sql(sql))
            };

            while let Some(item) = stream.try_next().await? {
                match item {
                    Either::Left(done) => {
                        write.affected_rows += done.rows_affected();
                        let rowid = done.last_insert_rowid();
                        if inserts && rowid > 0 {
                            write.insert_id = rowid as u64;
                        }
                    }
                    Either::Right(row) => rows.push(row.to_json_row(cast)),
                }
            }

            Ok((rows, write))
        })
    }
}
