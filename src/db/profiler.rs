//! Server-side statement profiling.
//!
//! With debug on and a MySQL backend, the session profiler is switched on
//! before a statement runs and its durations replace wall-clock timing.
//! Batched statements are flushed every [`PROFILER_BATCH_SIZE`] rows because
//! the server keeps at most that many profiles per session.

use crate::db::connection::GuardedConnection;
use crate::error::DbResult;
use crate::logger::QueryLogger;
use crate::models::{DatabaseType, QueryParam, QueryResponse};
use serde_json::Value as JsonValue;

/// Profiles the server retains between flushes.
pub const PROFILER_BATCH_SIZE: usize = 100;

const PROFILER_STATEMENTS: [&str; 4] = [
    "SET profiling_history_size = 0",
    "SET profiling = 0",
    "SET profiling_history_size = 100",
    "SET profiling = 1",
];

const TOTAL_DURATION: &str =
    "SELECT FORMAT(SUM(DURATION) * 1000, 4) AS `duration` FROM INFORMATION_SCHEMA.PROFILING";

const DURATION_PER_QUERY: &str = "SELECT FORMAT(SUM(DURATION) * 1000, 4) AS `duration` FROM INFORMATION_SCHEMA.PROFILING GROUP BY QUERY_ID";

/// Enable the session profiler when debug mode is on.
///
/// Returns whether profiling is active; callers fall back to wall-clock
/// timing otherwise.
pub async fn start(conn: &mut GuardedConnection, logger: &QueryLogger) -> DbResult<bool> {
    if !logger.settings().debug || conn.db_type() != Some(DatabaseType::MySQL) {
        return Ok(false);
    }
    reset(conn).await?;
    Ok(true)
}

async fn reset(conn: &mut GuardedConnection) -> DbResult<()> {
    for statement in PROFILER_STATEMENTS {
        conn.query(statement, &[]).await?;
    }
    Ok(())
}

/// Total duration of everything profiled since [`start`], in milliseconds.
pub async fn total(conn: &mut GuardedConnection) -> DbResult<Option<f64>> {
    let response = conn.query(TOTAL_DURATION, &[]).await?;
    Ok(durations(response).into_iter().next())
}

/// Per-statement durations since the last reset, then reset again for the
/// next batch.
pub async fn flush(conn: &mut GuardedConnection) -> DbResult<Vec<f64>> {
    let response = conn.query(DURATION_PER_QUERY, &[]).await?;
    reset(conn).await?;
    Ok(durations(response))
}

/// Statements waiting for their profiled durations.
#[derive(Debug, Default)]
pub struct PendingProfiles {
    entries: Vec<(String, Vec<QueryParam>)>,
}

impl PendingProfiles {
    pub fn push(&mut self, sql: &str, params: &[QueryParam]) {
        self.entries.push((sql.to_string(), params.to_vec()));
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= PROFILER_BATCH_SIZE
    }

    /// Log each pending statement with its profiled duration.
    pub async fn flush(
        &mut self,
        conn: &mut GuardedConnection,
        logger: &QueryLogger,
        resource: &str,
    ) -> DbResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let timings = flush(conn).await?;
        for ((sql, params), duration) in self.entries.drain(..).zip(timings) {
            logger.log_query(resource, &sql, duration, Some(&params));
        }
        Ok(())
    }
}

/// `FORMAT()` output uses thousands separators, e.g. `1,234.5678`.
fn parse_duration(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::String(s) => s.replace(',', "").parse().ok(),
        JsonValue::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn durations(response: QueryResponse) -> Vec<f64> {
    match response {
        QueryResponse::Rows(rows) => rows
            .iter()
            .filter_map(|row| row.get("duration").and_then(parse_duration))
            .collect(),
        QueryResponse::Write(_) => Vec::new(),
    }
}
