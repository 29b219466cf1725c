//! Database layer.
//!
//! This module provides:
//! - Primary/read pool management with connection retry
//! - Guarded connections with transaction tracking
//! - Parameter normalization and named placeholders
//! - Query, batched execute and transaction execution
//! - The fluent query builder
//! - TTL result cache and the migration runner

pub mod builder;
pub mod cache;
pub mod connection;
pub mod executor;
pub mod migrations;
pub mod params;
pub mod placeholders;
pub mod pool;
pub mod profiler;
pub mod response;
pub mod types;

pub use builder::{CompiledQuery, JoinKind, OrderDirection, Query};
pub use cache::{CacheInvalidation, QueryCache};
pub use connection::GuardedConnection;
pub use executor::{QueryExecutor, TRANSACTION_FAILED, TransactionScope};
pub use migrations::{
    Migration, MigrationExecutor, MigrationLoader, MigrationReport, MigrationRunner,
    RegisteredMigrations,
};
pub use placeholders::{NamedPlaceholders, PlaceholderTranslator};
pub use pool::{DbPool, PoolManager};
pub use types::DateStrings;
