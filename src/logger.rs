//! Pluggable logging sink, query timing log and the error reporting funnel.
//!
//! Every execution path hands its timing to [`QueryLogger::log_query`] and
//! every caller-facing error to [`QueryLogger::report`]. The sink defaults
//! to `tracing` and can be replaced at runtime with [`QueryLogger::set_logger`].

use crate::config::{RuntimeSettings, SettingsHandle};
use crate::error::DbError;
use crate::models::{QueryParam, params_to_json};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

tokio::task_local! {
    /// Present while an export runs for a callback caller.
    static CALLBACK_DELIVERY: ();
}

/// Run `fut` with errors delivered to a callback instead of the log.
///
/// [`QueryLogger::report`] still formats errors inside the scope but leaves
/// them for the callback.
pub async fn deliver_to_callback<F: Future>(fut: F) -> F::Output {
    CALLBACK_DELIVERY.scope((), fut).await
}

/// Page size of [`QueryLogger::resource_queries`].
pub const HISTORY_PAGE_SIZE: usize = 10;

/// A logging sink.
///
/// Every method has a default that forwards to `tracing`, so a custom sink
/// only overrides the levels it cares about.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str) {
        tracing::info!(target: "kjmysql", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "kjmysql", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "kjmysql", "{message}");
    }
}

/// The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {}

/// One executed query kept for live inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    /// Unix time in milliseconds
    pub date: i64,
    pub query: String,
    pub execution_time: f64,
    pub slow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub resource: String,
    pub queries: usize,
    pub time: f64,
}

/// Totals across every recorded resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySummary {
    pub resources: Vec<String>,
    pub total_queries: usize,
    pub slow_queries: usize,
    pub total_time: f64,
    pub usage: Vec<ResourceUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySort {
    Query,
    ExecutionTime,
}

/// Filter for one page of a resource's history.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub page: usize,
    /// Case-insensitive substring match on the SQL text
    pub search: Option<String>,
    /// Sort key and whether to sort descending
    pub sort: Option<(HistorySort, bool)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePage {
    pub queries: Vec<QueryRecord>,
    pub page_count: usize,
    pub resource_queries_count: usize,
    pub resource_slow_queries: usize,
    pub resource_time: f64,
}

pub struct QueryLogger {
    sink: RwLock<Arc<dyn Logger>>,
    settings: SettingsHandle,
    server_version: RwLock<Option<String>>,
    history: Mutex<HashMap<String, VecDeque<QueryRecord>>>,
    noise: Regex,
}

impl std::fmt::Debug for QueryLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLogger")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl QueryLogger {
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            sink: RwLock::new(Arc::new(TracingLogger)),
            settings,
            server_version: RwLock::new(None),
            history: Mutex::new(HashMap::new()),
            noise: Regex::new(r"SCRIPT ERROR: citizen:[\w/.]+:\d+[:\s]+")
                .expect("static pattern is valid"),
        }
    }

    /// Replace the logging sink.
    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = logger;
        self.log("Logging provider has been set.");
    }

    fn sink(&self) -> Arc<dyn Logger> {
        self.sink.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.settings.current()
    }

    pub fn log(&self, message: &str) {
        self.sink().log(message);
    }

    pub fn warn(&self, message: &str) {
        self.sink().warn(message);
    }

    pub fn error(&self, message: &str) {
        self.sink().error(message);
    }

    pub fn set_server_version(&self, version: impl Into<String>) {
        *self
            .server_version
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(version.into());
    }

    pub fn server_version(&self) -> Option<String> {
        self.server_version
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record the timing of one query.
    ///
    /// Slow queries are always logged as warnings; with debug on every
    /// query is logged. History is kept only while the UI toggle is on.
    pub fn log_query(
        &self,
        resource: &str,
        sql: &str,
        execution_time: f64,
        params: Option<&[QueryParam]>,
    ) {
        let settings = self.settings();
        let slow = execution_time >= settings.slow_query_warning_ms as f64;

        if slow || settings.debug {
            let version = self.server_version().unwrap_or_default();
            let params = params
                .filter(|p| !p.is_empty())
                .map(|p| format!(" {}", params_to_json(p)))
                .unwrap_or_default();
            let message = format!(
                "{version} {resource} took {execution_time:.4}ms to execute a query!\n{sql}{params}"
            );
            if slow {
                self.warn(message.trim_start());
            } else {
                self.log(message.trim_start());
            }
        }

        if !settings.ui {
            return;
        }

        let record = QueryRecord {
            date: chrono::Utc::now().timestamp_millis(),
            query: sql.to_string(),
            execution_time,
            slow,
        };
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let entries = history.entry(resource.to_string()).or_default();
        entries.push_back(record);
        while entries.len() > settings.log_size.max(1) {
            entries.pop_front();
        }
    }

    /// Warn about result sets above the configured size.
    pub fn validate_result_set(&self, resource: &str, sql: &str, rows: usize) {
        let threshold = self.settings().resultset_warning;
        if rows > threshold {
            self.warn(&format!(
                "{resource} executed a query that returned {rows} rows (warning threshold is {threshold})!\n{sql}"
            ));
        }
    }

    /// Format an error for the caller.
    ///
    /// Host stack noise is stripped and the caller's resource name is
    /// prefixed. The message goes to the error sink unless the call is
    /// running under [`deliver_to_callback`], where the callback receives it.
    pub fn report(
        &self,
        resource: &str,
        err: DbError,
        query: Option<&str>,
        params: Option<&JsonValue>,
    ) -> DbError {
        if matches!(err, DbError::Reported { .. }) {
            return err;
        }
        let message = self.noise.replace(&err.to_string(), "").into_owned();
        let mut output = format!("{resource} was unable to execute a query!");
        if let Some(query) = query {
            output.push_str(&format!("\nQuery: {query}"));
        }
        if let Some(params) = params.filter(|p| !p.is_null()) {
            output.push_str(&format!("\nParams: {params}"));
        }
        output.push('\n');
        output.push_str(&message);
        if CALLBACK_DELIVERY.try_with(|_| ()).is_err() {
            self.error(&output);
        }
        DbError::reported(output, err)
    }

    /// Totals across every resource with recorded history.
    pub fn summary(&self) -> QuerySummary {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut resources: Vec<&String> = history.keys().collect();
        resources.sort();

        let mut summary = QuerySummary {
            resources: resources.iter().map(|r| r.to_string()).collect(),
            total_queries: 0,
            slow_queries: 0,
            total_time: 0.0,
            usage: Vec::with_capacity(resources.len()),
        };
        for resource in resources {
            let entries = &history[resource];
            let time: f64 = entries.iter().map(|q| q.execution_time).sum();
            summary.total_queries += entries.len();
            summary.slow_queries += entries.iter().filter(|q| q.slow).count();
            summary.total_time += time;
            summary.usage.push(ResourceUsage {
                resource: resource.clone(),
                queries: entries.len(),
                time,
            });
        }
        summary
    }

    /// One page of a resource's history, or `None` if nothing was recorded.
    pub fn resource_queries(&self, resource: &str, filter: &HistoryQuery) -> Option<ResourcePage> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let entries = history.get(resource)?;

        let search = filter.search.as_ref().map(|s| s.to_lowercase());
        let mut matching: Vec<&QueryRecord> = entries
            .iter()
            .filter(|q| {
                search
                    .as_ref()
                    .is_none_or(|s| q.query.to_lowercase().contains(s))
            })
            .collect();

        if let Some((key, desc)) = filter.sort {
            matching.sort_by(|a, b| match key {
                HistorySort::Query => a.query.cmp(&b.query),
                HistorySort::ExecutionTime => a.execution_time.total_cmp(&b.execution_time),
            });
            if desc {
                matching.reverse();
            }
        }

        let resource_queries_count = matching.len();
        let resource_slow_queries = matching.iter().filter(|q| q.slow).count();
        let resource_time = matching.iter().map(|q| q.execution_time).sum();
        let queries = matching
            .into_iter()
            .skip(filter.page * HISTORY_PAGE_SIZE)
            .take(HISTORY_PAGE_SIZE)
            .cloned()
            .collect();

        Some(ResourcePage {
            queries,
            page_count: resource_queries_count.div_ceil(HISTORY_PAGE_SIZE),
            resource_queries_count,
            resource_slow_queries,
            resource_time,
        })
    }
}

impl Default for QueryLogger {
    fn default() -> Self {
        Self::new(SettingsHandle::default())
    }
}

/// Test sink that keeps every message.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CapturingLogger {
    pub warnings: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

#[cfg(test)]
impl Logger for CapturingLogger {
    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logger_with(settings: RuntimeSettings) -> (QueryLogger, Arc<CapturingLogger>) {
        let logger = QueryLogger::new(SettingsHandle::fixed(settings));
        let sink = Arc::new(CapturingLogger::default());
        logger.set_logger(sink.clone());
        (logger, sink)
    }

    #[test]
    fn test_report_strips_host_noise() {
        let (logger, _) = logger_with(RuntimeSettings::default());
        let err = DbError::query_execution(
            "SCRIPT ERROR: citizen:/scripting/lua/scheduler.lua:123: Unknown column 'x'",
            None,
        );
        let reported = logger.report(
            "shops",
            err,
            Some("SELECT x FROM items"),
            Some(&json!([1])),
        );
        assert_eq!(
            reported.to_string(),
            "shops was unable to execute a query!\nQuery: SELECT x FROM items\nParams: [1]\nUnknown column 'x'"
        );
        assert!(matches!(reported.root(), DbError::QueryExecution { .. }));
    }

    #[test]
    fn test_report_logs_to_sink() {
        let (logger, sink) = logger_with(RuntimeSettings::default());
        let reported = logger.report("shops", DbError::internal("boom"), None, None);
        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], reported.to_string());
    }

    #[tokio::test]
    async fn test_report_leaves_callback_errors_unlogged() {
        let (logger, sink) = logger_with(RuntimeSettings::default());
        let reported = deliver_to_callback(async {
            logger.report("shops", DbError::internal("boom"), None, None)
        })
        .await;
        assert!(reported.to_string().contains("shops was unable to execute a query!"));
        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_report_is_not_applied_twice() {
        let (logger, _) = logger_with(RuntimeSettings::default());
        let once = logger.report("a", DbError::internal("x"), None, None);
        let message = once.to_string();
        let twice = logger.report("b", once, Some("SELECT 1"), None);
        assert_eq!(twice.to_string(), message);
    }

    #[test]
    fn test_slow_query_warns() {
        let (logger, sink) = logger_with(RuntimeSettings::default());
        logger.log_query("shops", "SELECT 1", 250.0, None);
        logger.log_query("shops", "SELECT 2", 5.0, None);
        let warnings = sink.warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("shops took 250.0000ms"));
    }

    #[test]
    fn test_result_set_warning_threshold() {
        let (logger, sink) = logger_with(RuntimeSettings {
            resultset_warning: 2,
            ..RuntimeSettings::default()
        });
        logger.validate_result_set("shops", "SELECT * FROM items", 2);
        assert!(sink.warnings.lock().unwrap().is_empty());
        logger.validate_result_set("shops", "SELECT * FROM items", 3);
        assert_eq!(sink.warnings.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_history_recorded_only_with_ui() {
        let (logger, _) = logger_with(RuntimeSettings::default());
        logger.log_query("shops", "SELECT 1", 1.0, None);
        assert!(logger.summary().resources.is_empty());

        let (logger, _) = logger_with(RuntimeSettings {
            ui: true,
            log_size: 3,
            ..RuntimeSettings::default()
        });
        for i in 0..5 {
            logger.log_query("shops", &format!("SELECT {i}"), 1.0, None);
        }
        logger.log_query("bank", "SELECT balance", 300.0, None);

        let summary = logger.summary();
        assert_eq!(summary.resources, vec!["bank", "shops"]);
        assert_eq!(summary.total_queries, 4);
        assert_eq!(summary.slow_queries, 1);

        let page = logger
            .resource_queries("shops", &HistoryQuery::default())
            .unwrap();
        let queries: Vec<&str> = page.queries.iter().map(|q| q.query.as_str()).collect();
        assert_eq!(queries, vec!["SELECT 2", "SELECT 3", "SELECT 4"]);
        assert_eq!(page.page_count, 1);
    }

    #[test]
    fn test_history_search_and_sort() {
        let (logger, _) = logger_with(RuntimeSettings {
            ui: true,
            ..RuntimeSettings::default()
        });
        logger.log_query("shops", "SELECT * FROM items", 3.0, None);
        logger.log_query("shops", "UPDATE items SET price = 1", 9.0, None);
        logger.log_query("shops", "SELECT * FROM owners", 1.0, None);

        let page = logger
            .resource_queries(
                "shops",
                &HistoryQuery {
                    search: Some("select".into()),
                    sort: Some((HistorySort::ExecutionTime, true)),
                    ..Default::default()
                },
            )
            .unwrap();
        let queries: Vec<&str> = page.queries.iter().map(|q| q.query.as_str()).collect();
        assert_eq!(queries, vec!["SELECT * FROM items", "SELECT * FROM owners"]);
        assert!(logger.resource_queries("missing", &HistoryQuery::default()).is_none());
    }
}
