//! Error types for kjmysql.
//!
//! Every failure surfaced to callers is a [`DbError`]. Validation errors are
//! raised before a connection is acquired; driver failures arrive through the
//! `From<sqlx::Error>` conversion; and errors reported to external callers are
//! wrapped in [`DbError::Reported`] by the logger's formatting funnel.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Database pool unavailable: {message}")]
    PoolUnavailable { message: String },

    #[error("Expected {expected} parameters, but received {received}.")]
    ParameterCount { expected: usize, received: usize },

    #[error("{message}")]
    ParameterShape { message: String },

    #[error("{message}")]
    TransactionShape { message: String },

    #[error("{message}")]
    QueryExecution {
        message: String,
        /// e.g., "42S02" for unknown table
        sql_state: Option<String>,
    },

    #[error("{message}")]
    TransactionTimeout { message: String },

    #[error("Migration '{migration}' failed for {resource}: {message}")]
    Migration {
        resource: String,
        migration: String,
        message: String,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// An error after it went through the reporting funnel. The display
    /// string is the formatted message handed to callers.
    #[error("{message}")]
    Reported {
        message: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a pool unavailable error.
    pub fn pool_unavailable(message: impl Into<String>) -> Self {
        Self::PoolUnavailable {
            message: message.into(),
        }
    }

    pub fn parameter_count(expected: usize, received: usize) -> Self {
        Self::ParameterCount { expected, received }
    }

    pub fn parameter_shape(message: impl Into<String>) -> Self {
        Self::ParameterShape {
            message: message.into(),
        }
    }

    pub fn transaction_shape(message: impl Into<String>) -> Self {
        Self::TransactionShape {
            message: message.into(),
        }
    }

    /// Create a query execution error with optional SQL state.
    pub fn query_execution(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::QueryExecution {
            message: message.into(),
            sql_state,
        }
    }

    pub fn transaction_timeout(message: impl Into<String>) -> Self {
        Self::TransactionTimeout {
            message: message.into(),
        }
    }

    /// Create a migration error for one resource/file pair.
    pub fn migration(
        resource: impl Into<String>,
        migration: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Migration {
            resource: resource.into(),
            migration: migration.into(),
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap an error with its formatted, caller-facing message.
    pub fn reported(message: impl Into<String>, source: DbError) -> Self {
        Self::Reported {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// The underlying error, looking through any `Reported` wrapper.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Reported { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Validation errors are raised before any connection is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            Self::ParameterCount { .. }
                | Self::ParameterShape { .. }
                | Self::TransactionShape { .. }
                | Self::InvalidInput { .. }
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolUnavailable { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::query_execution(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::query_execution("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::pool_unavailable("Connection pool is closed")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify the ssl option of the connection string",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query_execution(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::query_execution(err.to_string(), None),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
