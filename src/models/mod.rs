//! Data models shared across kjmysql.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionOptions, DatabaseType, DEFAULT_MYSQL_HOST, DEFAULT_MYSQL_PORT};
pub use query::{
    Intent, JsonRow, QueryKind, QueryParam, QueryResponse, Statement, WriteResult, params_to_json,
};
