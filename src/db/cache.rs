//! TTL cache for read results.
//!
//! Keys are opaque caller-supplied strings. Expired entries are never
//! returned; a background sweep removes them periodically.

use crate::config::{DEFAULT_CACHE_CHECK_PERIOD_SECS, DEFAULT_CACHE_TTL_SECS};
use crate::error::DbResult;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    /// `None` never expires
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Which entries to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheInvalidation {
    All,
    Key(String),
    Keys(Vec<String>),
}

impl From<&JsonValue> for CacheInvalidation {
    /// `null` clears everything, a string or number names one key, and an
    /// array names several.
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::All,
            JsonValue::String(key) => Self::Key(key.clone()),
            JsonValue::Array(keys) => Self::Keys(
                keys.iter()
                    .map(|k| match k {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => Self::Key(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct QueryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CACHE_TTL_SECS))
    }
}

impl QueryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    fn expiry(&self, ttl_secs: Option<u64>) -> Option<Instant> {
        match ttl_secs {
            Some(0) => None,
            Some(secs) => Some(Instant::now() + Duration::from_secs(secs)),
            None if self.default_ttl.is_zero() => None,
            None => Some(Instant::now() + self.default_ttl),
        }
    }

    /// A live value for `key`.
    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    /// Store a value. `ttl_secs` of `None` uses the default TTL and
    /// `Some(0)` never expires.
    pub async fn set(&self, key: impl Into<String>, value: JsonValue, ttl_secs: Option<u64>) {
        let entry = CacheEntry {
            value,
            expires_at: self.expiry(ttl_secs),
        };
        self.entries.write().await.insert(key.into(), entry);
    }

    /// Return the cached value for `key`, or run `producer` and cache its
    /// result. Null results are returned but not cached.
    pub async fn get_or_cache<F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u64>,
        producer: F,
    ) -> DbResult<JsonValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<JsonValue>>,
    {
        if let Some(value) = self.get(key).await {
            debug!(key = %key, "Cache hit");
            return Ok(value);
        }

        let value = producer().await?;
        if !value.is_null() {
            self.set(key, value.clone(), ttl_secs).await;
        }
        Ok(value)
    }

    /// Drop entries; returns how many were removed.
    pub async fn invalidate(&self, target: CacheInvalidation) -> usize {
        let mut entries = self.entries.write().await;
        match target {
            CacheInvalidation::All => {
                let count = entries.len();
                entries.clear();
                count
            }
            CacheInvalidation::Key(key) => usize::from(entries.remove(&key).is_some()),
            CacheInvalidation::Keys(keys) => keys
                .iter()
                .filter(|key| entries.remove(key.as_str()).is_some())
                .count(),
        }
    }

    /// Remove expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Start a background task that purges expired entries every `period`
    /// (120 seconds when `None`).
    pub fn start_cleanup_task(self: Arc<Self>, period: Option<Duration>) -> JoinHandle<()> {
        let period = period.unwrap_or(Duration::from_secs(DEFAULT_CACHE_CHECK_PERIOD_SECS));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let removed = self.purge_expired().await;
                if removed > 0 {
                    debug!(removed, "Purged expired cache entries");
                }
            }
        })
    }
}
