//! kjmysql library
//!
//! Pooled MySQL access for game-server resources: parameterized queries,
//! batched prepared execution, atomic and caller-driven transactions, a
//! fluent query builder, a TTL result cache and per-resource migrations.

pub mod config;
pub mod db;
pub mod error;
pub mod exports;
pub mod logger;
pub mod models;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use exports::{Export, ExportCall, ExportRegistry, Exports};
pub use logger::{Logger, QueryLogger};
