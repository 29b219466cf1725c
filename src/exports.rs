//! The service surface other resources call.
//!
//! [`Exports`] is the typed API. [`ExportRegistry`] maps `(namespace, name)`
//! pairs onto it for callers that dispatch by name with JSON arguments,
//! including the `ghmattimysql` and `mysql-async` compatibility namespaces.

use crate::config::{Config, SettingsHandle};
use crate::db::cache::{CacheInvalidation, QueryCache};
use crate::db::migrations::{MigrationLoader, MigrationReport, MigrationRunner, RegisteredMigrations};
use crate::db::{PoolManager, Query, QueryExecutor, TransactionScope};
use crate::error::{DbError, DbResult};
use crate::logger::{Logger, QueryLogger, deliver_to_callback};
use crate::models::QueryKind;
use futures_util::future::BoxFuture;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const NAMESPACE: &str = "kjmysql";
pub const GHMATTI_NAMESPACE: &str = "ghmattimysql";
pub const MYSQL_ASYNC_NAMESPACE: &str = "mysql-async";

pub struct Exports {
    executor: Arc<QueryExecutor>,
    cache: Arc<QueryCache>,
    migrations: tokio::sync::RwLock<MigrationRunner>,
    stored: RwLock<Vec<String>>,
}

impl std::fmt::Debug for Exports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exports")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Exports {
    /// Build on an existing pool manager. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(pools: Arc<PoolManager>) -> Self {
        let timeout = pools.pool_options().transaction_timeout_or_default();
        let executor = QueryExecutor::new(Arc::clone(&pools)).with_transaction_timeout(timeout);
        Self::with_executor(Arc::new(executor))
    }

    pub fn with_executor(executor: Arc<QueryExecutor>) -> Self {
        let loader: Arc<dyn MigrationLoader> = Arc::new(RegisteredMigrations::new());
        let runner = MigrationRunner::new(Arc::clone(executor.pools()), loader);
        Self {
            executor,
            cache: Arc::new(QueryCache::default()),
            migrations: tokio::sync::RwLock::new(runner),
            stored: RwLock::new(Vec::new()),
        }
    }

    /// Resolve the configured connection strings into a ready-to-start
    /// service.
    pub fn from_config(config: &Config, settings: SettingsHandle) -> DbResult<Self> {
        let logger = Arc::new(QueryLogger::new(settings));
        let pools = PoolManager::new(
            &config.connection_string,
            config.read_connection(),
            config.pool_options(),
            logger,
        )?;
        Ok(Self::new(Arc::new(pools)))
    }

    /// Spawn the connect loop and the cache sweep.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!("kjmysql has started");
        vec![
            self.executor.pools().start(),
            Arc::clone(&self.cache).start_cleanup_task(None),
        ]
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        self.executor.pools()
    }

    pub fn logger(&self) -> &Arc<QueryLogger> {
        self.executor.logger()
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.logger().set_logger(logger);
    }

    pub async fn set_migration_loader(&self, loader: Arc<dyn MigrationLoader>) {
        self.migrations.write().await.set_loader(loader);
    }

    pub fn is_ready(&self) -> bool {
        self.pools().is_ready()
    }

    /// Wait for the primary pool.
    pub async fn await_connection(&self) -> DbResult<bool> {
        self.pools().await_ready().await.map(|_| true)
    }

    pub async fn query(&self, resource: &str, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        self.executor
            .raw_query(QueryKind::Raw, resource, sql, params)
            .await
    }

    pub async fn single(&self, resource: &str, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        self.executor
            .raw_query(QueryKind::Single, resource, sql, params)
            .await
    }

    pub async fn scalar(&self, resource: &str, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        self.executor
            .raw_query(QueryKind::Scalar, resource, sql, params)
            .await
    }

    pub async fn insert(&self, resource: &str, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        self.executor
            .raw_query(QueryKind::Insert, resource, sql, params)
            .await
    }

    pub async fn update(&self, resource: &str, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        self.executor
            .raw_query(QueryKind::Update, resource, sql, params)
            .await
    }

    pub async fn prepare(&self, resource: &str, sql: &str, params: &JsonValue) -> DbResult<JsonValue> {
        self.executor.raw_execute(resource, sql, params).await
    }

    pub async fn raw_execute(
        &self,
        resource: &str,
        sql: &str,
        params: &JsonValue,
    ) -> DbResult<JsonValue> {
        self.executor.raw_execute(resource, sql, params).await
    }

    /// Run a batch atomically. Stored query handles are accepted wherever
    /// the batch expects SQL text.
    pub async fn transaction(
        &self,
        resource: &str,
        queries: &JsonValue,
        params: &JsonValue,
    ) -> DbResult<bool> {
        let queries = self
            .resolve_batch(queries)
            .map_err(|e| self.logger().report(resource, e, None, None))?;
        self.executor
            .raw_transaction(resource, &queries, params)
            .await
    }

    pub async fn start_transaction<F, Fut>(&self, resource: &str, body: F) -> DbResult<bool>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = DbResult<Option<bool>>>,
    {
        self.logger().warn(
            "[kjmysql] startTransaction is experimental and may receive breaking changes.",
        );
        self.executor.start_transaction(resource, body).await
    }

    /// Keep SQL text for later use by handle. Handles count up from 0 in
    /// registration order.
    pub fn store(&self, sql: impl Into<String>) -> usize {
        let mut stored = self.stored.write().unwrap_or_else(|e| e.into_inner());
        stored.push(sql.into());
        stored.len() - 1
    }

    /// The SQL behind a stored handle.
    pub fn stored(&self, handle: usize) -> DbResult<String> {
        self.stored
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle)
            .cloned()
            .ok_or_else(|| DbError::invalid_input(format!("No stored query with handle {handle}")))
    }

    /// A builder bound to this service, attributed to `resource`.
    pub fn table(&self, resource: &str, name: &str) -> Query {
        Query::table(name).bind(Arc::clone(&self.executor), resource)
    }

    pub async fn query_cached(
        &self,
        resource: &str,
        key: &str,
        ttl_secs: Option<u64>,
        sql: &str,
        params: &JsonValue,
    ) -> DbResult<JsonValue> {
        self.cache
            .get_or_cache(key, ttl_secs, || self.query(resource, sql, params))
            .await
    }

    pub async fn single_cached(
        &self,
        resource: &str,
        key: &str,
        ttl_secs: Option<u64>,
        sql: &str,
        params: &JsonValue,
    ) -> DbResult<JsonValue> {
        self.cache
            .get_or_cache(key, ttl_secs, || self.single(resource, sql, params))
            .await
    }

    pub async fn scalar_cached(
        &self,
        resource: &str,
        key: &str,
        ttl_secs: Option<u64>,
        sql: &str,
        params: &JsonValue,
    ) -> DbResult<JsonValue> {
        self.cache
            .get_or_cache(key, ttl_secs, || self.scalar(resource, sql, params))
            .await
    }

    /// Drop cached results; returns how many entries were removed.
    pub async fn clear_cache(&self, target: CacheInvalidation) -> usize {
        let label = match &target {
            CacheInvalidation::All => "ALL".to_string(),
            CacheInvalidation::Key(key) => key.clone(),
            CacheInvalidation::Keys(keys) => keys.join(", "),
        };
        let removed = self.cache.invalidate(target).await;
        self.logger()
            .log(&format!("[kjmysql] Cache cleared: {label}"));
        removed
    }

    pub async fn run_migrations(
        &self,
        resource: &str,
        path: impl AsRef<Path>,
    ) -> DbResult<MigrationReport> {
        self.migrations.read().await.run(resource, path).await
    }

    /// Send an argument error through the same funnel as query errors.
    fn reject(&self, resource: &str, err: DbError) -> DbError {
        self.logger().report(resource, err, None, None)
    }

    fn resolve_sql(&self, value: &JsonValue) -> DbResult<String> {
        match value {
            JsonValue::String(sql) => Ok(sql.clone()),
            JsonValue::Number(n) => {
                let handle = n
                    .as_u64()
                    .ok_or_else(|| DbError::invalid_input(format!("Invalid query handle {n}")))?;
                self.stored(handle as usize)
            }
            other => Err(DbError::invalid_input(format!(
                "Expected SQL text or a stored query handle, received {other}"
            ))),
        }
    }

    /// Replace stored handles in a transaction batch with their SQL.
    fn resolve_batch(&self, queries: &JsonValue) -> DbResult<JsonValue> {
        let JsonValue::Array(items) = queries else {
            return Ok(queries.clone());
        };
        items
            .iter()
            .map(|item| match item {
                JsonValue::Number(_) => self.resolve_sql(item).map(JsonValue::String),
                JsonValue::Array(pair) => {
                    let mut pair = pair.clone();
                    if let Some(first @ JsonValue::Number(_)) = pair.first_mut() {
                        *first = JsonValue::String(self.resolve_sql(first)?);
                    }
                    Ok(JsonValue::Array(pair))
                }
                JsonValue::Object(obj) => {
                    let mut obj = obj.clone();
                    if let Some(query @ JsonValue::Number(_)) = obj.get_mut("query") {
                        *query = JsonValue::String(self.resolve_sql(query)?);
                    }
                    Ok(JsonValue::Object(obj))
                }
                other => Ok(other.clone()),
            })
            .collect::<DbResult<Vec<_>>>()
            .map(JsonValue::Array)
    }
}

/// Arguments of one dispatched call.
#[derive(Debug, Clone, Default)]
pub struct ExportCall {
    /// Name of the calling resource, used in logs and error messages.
    pub resource: String,
    pub args: Vec<JsonValue>,
}

impl ExportCall {
    pub fn new(resource: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self {
            resource: resource.into(),
            args,
        }
    }

    /// Positional argument, `null` when absent.
    pub fn arg(&self, index: usize) -> &JsonValue {
        self.args.get(index).unwrap_or(&JsonValue::Null)
    }

    fn str_arg(&self, index: usize, name: &str) -> DbResult<&str> {
        self.arg(index)
            .as_str()
            .ok_or_else(|| DbError::invalid_input(format!("Argument '{name}' must be a string")))
    }
}

pub type ExportFuture = BoxFuture<'static, DbResult<JsonValue>>;
pub type Handler = Arc<dyn Fn(Arc<Exports>, ExportCall) -> ExportFuture + Send + Sync>;

/// How a registered export delivers its result.
#[derive(Clone)]
pub enum Export {
    /// Result goes to a `(result, error)` callback.
    Callback(Handler),
    /// Result is awaited by the caller.
    Async(Handler),
}

impl Export {
    fn handler(&self) -> &Handler {
        match self {
            Self::Callback(handler) | Self::Async(handler) => handler,
        }
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Export::Callback"),
            Self::Async(_) => f.write_str("Export::Async"),
        }
    }
}

fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Exports>, ExportCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DbResult<JsonValue>> + Send + 'static,
{
    Arc::new(move |exports, call| Box::pin(f(exports, call)))
}

fn query_handler(kind: QueryKind) -> Handler {
    handler(move |exports: Arc<Exports>, call: ExportCall| async move {
        let sql = exports
            .resolve_sql(call.arg(0))
            .map_err(|e| exports.reject(&call.resource, e))?;
        exports
            .executor
            .raw_query(kind, &call.resource, &sql, call.arg(1))
            .await
    })
}

fn execute_handler() -> Handler {
    handler(|exports: Arc<Exports>, call: ExportCall| async move {
        let sql = exports
            .resolve_sql(call.arg(0))
            .map_err(|e| exports.reject(&call.resource, e))?;
        exports
            .raw_execute(&call.resource, &sql, call.arg(1))
            .await
    })
}

fn transaction_handler() -> Handler {
    handler(|exports: Arc<Exports>, call: ExportCall| async move {
        exports
            .transaction(&call.resource, call.arg(0), call.arg(1))
            .await
            .map(JsonValue::Bool)
    })
}

fn store_handler() -> Handler {
    handler(|exports: Arc<Exports>, call: ExportCall| async move {
        let sql = call
            .str_arg(0, "query")
            .map_err(|e| exports.reject(&call.resource, e))?;
        Ok(json!(exports.store(sql)))
    })
}

/// `(key, ttl, query, params)`
fn cached_handler(kind: QueryKind) -> Handler {
    handler(move |exports: Arc<Exports>, call: ExportCall| async move {
        let key = call
            .str_arg(0, "key")
            .map_err(|e| exports.reject(&call.resource, e))?;
        let ttl = call.arg(1).as_u64();
        let sql = exports
            .resolve_sql(call.arg(2))
            .map_err(|e| exports.reject(&call.resource, e))?;
        let resource = call.resource.as_str();
        let params = call.arg(3);
        exports
            .cache
            .get_or_cache(key, ttl, || exports.executor.raw_query(kind, resource, &sql, params))
            .await
    })
}

/// Name-based dispatch onto an [`Exports`] instance.
///
/// Populated once at construction; callers look exports up by namespace
/// and name.
pub struct ExportRegistry {
    exports: Arc<Exports>,
    entries: HashMap<(String, String), Export>,
}

impl std::fmt::Debug for ExportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportRegistry")
            .field("exports", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl ExportRegistry {
    pub fn new(exports: Arc<Exports>) -> Self {
        let mut registry = Self {
            exports,
            entries: HashMap::new(),
        };
        registry.register_kjmysql();
        registry.register_ghmatti();
        registry.register_mysql_async();
        debug!(exports = registry.entries.len(), "Export registry populated");
        registry
    }

    fn register_kjmysql(&mut self) {
        let operations = [
            ("query", query_handler(QueryKind::Raw)),
            ("single", query_handler(QueryKind::Single)),
            ("scalar", query_handler(QueryKind::Scalar)),
            ("insert", query_handler(QueryKind::Insert)),
            ("update", query_handler(QueryKind::Update)),
            ("transaction", transaction_handler()),
            ("prepare", execute_handler()),
            ("rawExecute", execute_handler()),
            ("store", store_handler()),
        ];
        for (name, handler) in operations {
            self.register(NAMESPACE, &format!("{name}_async"), Export::Async(handler.clone()));
            self.register(NAMESPACE, name, Export::Callback(handler));
        }

        self.register(NAMESPACE, "query_cached", Export::Async(cached_handler(QueryKind::Raw)));
        self.register(
            NAMESPACE,
            "single_cached",
            Export::Async(cached_handler(QueryKind::Single)),
        );
        self.register(
            NAMESPACE,
            "scalar_cached",
            Export::Async(cached_handler(QueryKind::Scalar)),
        );
        self.register(
            NAMESPACE,
            "clearCache",
            Export::Async(handler(|exports: Arc<Exports>, call: ExportCall| async move {
                let removed = exports
                    .clear_cache(CacheInvalidation::from(call.arg(0)))
                    .await;
                Ok(json!(removed))
            })),
        );
        self.register(
            NAMESPACE,
            "runMigrations",
            Export::Async(handler(|exports: Arc<Exports>, call: ExportCall| async move {
                let resource = call
                    .str_arg(0, "resource")
                    .map_err(|e| exports.reject(&call.resource, e))?;
                let path = call
                    .str_arg(1, "path")
                    .map_err(|e| exports.reject(&call.resource, e))?;
                let report = exports.run_migrations(resource, path).await?;
                serde_json::to_value(report).map_err(|e| DbError::internal(e.to_string()))
            })),
        );
        self.register(
            NAMESPACE,
            "isReady",
            Export::Async(handler(|exports: Arc<Exports>, _call: ExportCall| async move {
                Ok(JsonValue::Bool(exports.is_ready()))
            })),
        );
        self.register(
            NAMESPACE,
            "awaitConnection",
            Export::Async(handler(|exports: Arc<Exports>, _call: ExportCall| async move {
                exports.await_connection().await.map(JsonValue::Bool)
            })),
        );
    }

    fn register_ghmatti(&mut self) {
        let aliases = [
            ("execute", query_handler(QueryKind::Raw)),
            ("scalar", query_handler(QueryKind::Scalar)),
            ("transaction", transaction_handler()),
        ];
        for (name, handler) in aliases {
            self.register(GHMATTI_NAMESPACE, &format!("{name}Sync"), Export::Async(handler.clone()));
            self.register(GHMATTI_NAMESPACE, name, Export::Callback(handler));
        }
        self.register(GHMATTI_NAMESPACE, "store", Export::Callback(store_handler()));
    }

    fn register_mysql_async(&mut self) {
        let aliases = [
            ("mysql_execute", query_handler(QueryKind::Update)),
            ("mysql_insert", query_handler(QueryKind::Insert)),
            ("mysql_fetch_all", query_handler(QueryKind::Raw)),
            ("mysql_fetch_scalar", query_handler(QueryKind::Scalar)),
            ("mysql_transaction", transaction_handler()),
            ("mysql_store", store_handler()),
        ];
        for (name, handler) in aliases {
            self.register(MYSQL_ASYNC_NAMESPACE, name, Export::Callback(handler));
        }
    }

    /// Add or replace an export.
    pub fn register(&mut self, namespace: &str, name: &str, export: Export) {
        self.entries
            .insert((namespace.to_string(), name.to_string()), export);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&Export> {
        self.entries
            .get(&(namespace.to_string(), name.to_string()))
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.get(namespace, name).is_some()
    }

    /// Export names in a namespace, sorted.
    pub fn names(&self, namespace: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    fn lookup(&self, namespace: &str, name: &str) -> DbResult<&Export> {
        self.get(namespace, name)
            .ok_or_else(|| DbError::invalid_input(format!("No export named {namespace}:{name}")))
    }

    /// Invoke an async export and return its result.
    pub async fn call(&self, namespace: &str, name: &str, call: ExportCall) -> DbResult<JsonValue> {
        match self.lookup(namespace, name)? {
            Export::Async(handler) => handler(Arc::clone(&self.exports), call).await,
            Export::Callback(_) => Err(DbError::invalid_input(format!(
                "{namespace}:{name} takes a callback"
            ))),
        }
    }

    /// Invoke a callback export.
    ///
    /// The callback runs exactly once: `(result, None)` on success or
    /// `(null, Some(message))` on failure. `Err` is returned only when the
    /// export cannot be dispatched, and then the callback is not run.
    pub async fn call_with_callback<C>(
        &self,
        namespace: &str,
        name: &str,
        call: ExportCall,
        callback: C,
    ) -> DbResult<()>
    where
        C: FnOnce(JsonValue, Option<String>),
    {
        let export = self.lookup(namespace, name)?;
        let Export::Callback(_) = export else {
            return Err(DbError::invalid_input(format!(
                "{namespace}:{name} does not take a callback"
            )));
        };
        let result = deliver_to_callback(export.handler()(Arc::clone(&self.exports), call)).await;
        match result {
            Ok(result) => callback(result, None),
            Err(e) => callback(JsonValue::Null, Some(e.to_string())),
        }
        Ok(())
    }
}
