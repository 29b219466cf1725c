//! Configuration handling for kjmysql.
//!
//! Static settings (connection strings, pool sizing) come from CLI arguments
//! and environment variables. Runtime settings (debug, UI, warning
//! thresholds) are re-read on a short interval and published through a
//! [`SettingsHandle`] without touching the pools.

use crate::models::QueryKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub const DEFAULT_SLOW_QUERY_WARNING_MS: u64 = 200;
pub const DEFAULT_RESULTSET_WARNING: usize = 1000;
pub const DEFAULT_LOG_SIZE: usize = 100;
pub const DEFAULT_DEBUG_LOG_SIZE: usize = 10000;
pub const DEFAULT_CONNECT_RETRY_SECS: u64 = 30;
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 600;
pub const DEFAULT_CACHE_CHECK_PERIOD_SECS: u64 = 120;
pub const SETTINGS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 60;

pub const ENV_DEBUG: &str = "MYSQL_DEBUG";
pub const ENV_UI: &str = "MYSQL_UI";
pub const ENV_SLOW_QUERY_WARNING: &str = "MYSQL_SLOW_QUERY_WARNING";
pub const ENV_RESULTSET_WARNING: &str = "MYSQL_RESULTSET_WARNING";
pub const ENV_LOG_SIZE: &str = "MYSQL_LOG_SIZE";

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10 for MySQL, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum idle connections kept open (default: 0)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 60)
    pub acquire_timeout_secs: Option<u64>,
    /// Delay between attempts to reach the primary server (default: 30)
    pub connect_retry_secs: Option<u64>,
    /// Wall clock limit of a managed transaction (default: 30)
    pub transaction_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    pub fn connect_retry_or_default(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs.unwrap_or(DEFAULT_CONNECT_RETRY_SECS))
    }

    pub fn transaction_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.transaction_timeout_secs
                .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT_SECS),
        )
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
            if let Some(min) = self.min_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        if self.transaction_timeout_secs == Some(0) {
            return Err("transaction_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Settings that may change while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Log every query and enable the server-side profiler.
    pub debug: bool,
    /// Record per-resource query history for live inspection.
    pub ui: bool,
    pub slow_query_warning_ms: u64,
    pub resultset_warning: usize,
    /// History entries kept per resource when `ui` is on.
    pub log_size: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            debug: false,
            ui: false,
            slow_query_warning_ms: DEFAULT_SLOW_QUERY_WARNING_MS,
            resultset_warning: DEFAULT_RESULTSET_WARNING,
            log_size: DEFAULT_LOG_SIZE,
        }
    }
}

/// Somewhere runtime settings can be read from.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> RuntimeSettings;
}

/// A source that never changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSettings(pub RuntimeSettings);

impl SettingsSource for StaticSettings {
    fn load(&self) -> RuntimeSettings {
        self.0
    }
}

/// Reads the `MYSQL_*` environment variables on every load, falling back to
/// the values the process was started with.
#[derive(Debug, Clone, Copy)]
pub struct EnvSettingsSource {
    base: RuntimeSettings,
}

impl EnvSettingsSource {
    pub fn new(base: RuntimeSettings) -> Self {
        Self { base }
    }
}

impl SettingsSource for EnvSettingsSource {
    fn load(&self) -> RuntimeSettings {
        let debug = env_flag(ENV_DEBUG).unwrap_or(self.base.debug);
        let default_log_size = if debug && !self.base.debug {
            DEFAULT_DEBUG_LOG_SIZE
        } else {
            self.base.log_size
        };
        RuntimeSettings {
            debug,
            ui: env_flag(ENV_UI).unwrap_or(self.base.ui),
            slow_query_warning_ms: env_number(ENV_SLOW_QUERY_WARNING)
                .unwrap_or(self.base.slow_query_warning_ms),
            resultset_warning: env_number(ENV_RESULTSET_WARNING)
                .unwrap_or(self.base.resultset_warning),
            log_size: env_number(ENV_LOG_SIZE).unwrap_or(default_log_size),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Read side of the runtime settings channel.
#[derive(Debug, Clone)]
pub struct SettingsHandle(watch::Receiver<RuntimeSettings>);

impl SettingsHandle {
    /// Settings that never change (tests, embedding without a refresh loop).
    pub fn fixed(settings: RuntimeSettings) -> Self {
        let (_tx, rx) = watch::channel(settings);
        Self(rx)
    }

    /// Load from `source` now and again on every `interval` tick.
    ///
    /// The refresh task ends once every handle has been dropped.
    pub fn spawn_refresh(
        source: Arc<dyn SettingsSource>,
        interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(source.load());
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let next = source.load();
                tx.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    if current.debug != next.debug {
                        info!(debug = next.debug, "Debug mode changed");
                    }
                    *current = next;
                    true
                });
            }
        });
        (Self(rx), task)
    }

    /// The latest published settings.
    pub fn current(&self) -> RuntimeSettings {
        *self.0.borrow()
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::fixed(RuntimeSettings::default())
    }
}

/// Maintenance commands run by the binary.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Apply pending migrations of one resource
    Migrate {
        /// Resource name recorded in the ledger
        #[arg(long)]
        resource: String,
        /// Directory holding the migration files
        #[arg(long)]
        path: PathBuf,
    },
    /// Run a single query and print the classified result as JSON
    Query {
        sql: String,
        /// Parameters as JSON (array or named object)
        #[arg(long, default_value = "[]")]
        params: String,
        /// raw, single, scalar, insert or update
        #[arg(long, default_value = "raw")]
        kind: QueryKind,
    },
}

/// Configuration for the kjmysql binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "kjmysql",
    about = "MySQL access layer: queries, transactions and migrations for game-server resources",
    version,
    author
)]
pub struct Config {
    /// Primary (write) connection string, URI or key=value form
    #[arg(long, default_value = "", env = "MYSQL_CONNECTION_STRING")]
    pub connection_string: String,

    /// Optional read replica connection string
    #[arg(long, env = "MYSQL_READ_CONNECTION_STRING")]
    pub read_connection_string: Option<String>,

    /// Queries at or above this many milliseconds are logged as slow
    #[arg(
        long,
        default_value_t = DEFAULT_SLOW_QUERY_WARNING_MS,
        env = "MYSQL_SLOW_QUERY_WARNING"
    )]
    pub slow_query_warning: u64,

    /// Warn when a result set has more rows than this
    #[arg(
        long,
        default_value_t = DEFAULT_RESULTSET_WARNING,
        env = "MYSQL_RESULTSET_WARNING"
    )]
    pub resultset_warning: usize,

    /// Log every query and enable the profiler
    #[arg(long, env = "MYSQL_DEBUG")]
    pub debug: bool,

    /// Keep per-resource query history for live inspection
    #[arg(long, env = "MYSQL_UI")]
    pub ui: bool,

    /// History entries per resource (default: 10000 with --debug, else 100)
    #[arg(long, env = "MYSQL_LOG_SIZE")]
    pub log_size: Option<usize>,

    #[arg(long, env = "MYSQL_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    #[arg(long, env = "MYSQL_MIN_CONNECTIONS")]
    pub min_connections: Option<u32>,

    /// Connection acquire timeout in seconds
    #[arg(long, env = "MYSQL_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: Option<u64>,

    /// Idle connection timeout in seconds
    #[arg(long, env = "MYSQL_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Seconds between attempts to reach the primary server
    #[arg(long, default_value_t = DEFAULT_CONNECT_RETRY_SECS, env = "MYSQL_CONNECT_RETRY")]
    pub connect_retry: u64,

    /// Managed transaction timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_TRANSACTION_TIMEOUT_SECS,
        env = "MYSQL_TRANSACTION_TIMEOUT"
    )]
    pub transaction_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KJMYSQL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "KJMYSQL_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            connection_string: String::new(),
            read_connection_string: None,
            slow_query_warning: DEFAULT_SLOW_QUERY_WARNING_MS,
            resultset_warning: DEFAULT_RESULTSET_WARNING,
            debug: false,
            ui: false,
            log_size: None,
            max_connections: None,
            min_connections: None,
            acquire_timeout: None,
            idle_timeout: None,
            connect_retry: DEFAULT_CONNECT_RETRY_SECS,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT_SECS,
            log_level: "info".to_string(),
            json_logs: false,
            command: None,
        }
    }

    /// Pool options from the CLI/env values.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            idle_timeout_secs: self.idle_timeout,
            acquire_timeout_secs: self.acquire_timeout,
            connect_retry_secs: Some(self.connect_retry),
            transaction_timeout_secs: Some(self.transaction_timeout),
        }
    }

    /// Runtime settings as of startup.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            debug: self.debug,
            ui: self.ui,
            slow_query_warning_ms: self.slow_query_warning,
            resultset_warning: self.resultset_warning,
            log_size: self.log_size.unwrap_or(if self.debug {
                DEFAULT_DEBUG_LOG_SIZE
            } else {
                DEFAULT_LOG_SIZE
            }),
        }
    }

    /// The read replica string, if one was given and is not blank.
    pub fn read_connection(&self) -> Option<&str> {
        self.read_connection_string
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.slow_query_warning, DEFAULT_SLOW_QUERY_WARNING_MS);
        assert_eq!(config.resultset_warning, DEFAULT_RESULTSET_WARNING);
        assert_eq!(config.read_connection(), None);
        assert_eq!(config.runtime_settings(), RuntimeSettings::default());
    }

    #[test]
    fn test_debug_raises_default_log_size() {
        let config = Config {
            debug: true,
            ..Config::default()
        };
        assert_eq!(config.runtime_settings().log_size, DEFAULT_DEBUG_LOG_SIZE);

        let config = Config {
            debug: true,
            log_size: Some(50),
            ..Config::default()
        };
        assert_eq!(config.runtime_settings().log_size, 50);
    }

    #[test]
    fn test_blank_read_connection_is_ignored() {
        let config = Config {
            read_connection_string: Some("  ".into()),
            ..Config::default()
        };
        assert_eq!(config.read_connection(), None);
    }

    #[test]
    fn test_pool_option_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_connections_or_default(false), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(opts.max_connections_or_default(true), DEFAULT_MAX_CONNECTIONS_SQLITE);
        assert_eq!(opts.connect_retry_or_default(), Duration::from_secs(30));
        assert_eq!(opts.transaction_timeout_or_default(), Duration::from_secs(30));
    }

    #[test]
    fn test_pool_options_validate() {
        let bad = PoolOptions {
            max_connections: Some(2),
            min_connections: Some(5),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let zero = PoolOptions {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let ok = PoolOptions {
            max_connections: Some(5),
            min_connections: Some(1),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_cli_parses_query_command() {
        let config = Config::try_parse_from([
            "kjmysql",
            "--connection-string",
            "mysql://root@localhost/game",
            "query",
            "SELECT 1",
            "--kind",
            "scalar",
        ])
        .unwrap();
        match config.command {
            Some(Command::Query { sql, kind, .. }) => {
                assert_eq!(sql, "SELECT 1");
                assert_eq!(kind, QueryKind::Scalar);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fixed_settings_handle() {
        let settings = RuntimeSettings {
            debug: true,
            ..RuntimeSettings::default()
        };
        let handle = SettingsHandle::fixed(settings);
        assert!(handle.current().debug);
    }

    struct Flipping(std::sync::atomic::AtomicBool);

    impl SettingsSource for Flipping {
        fn load(&self) -> RuntimeSettings {
            RuntimeSettings {
                debug: self.0.load(std::sync::atomic::Ordering::SeqCst),
                ..RuntimeSettings::default()
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_publishes_changes() {
        let source = Arc::new(Flipping(std::sync::atomic::AtomicBool::new(false)));
        let (handle, task) = SettingsHandle::spawn_refresh(source.clone(), Duration::from_secs(1));
        assert!(!handle.current().debug);

        source.0.store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(handle.current().debug);
        task.abort();
    }
}
