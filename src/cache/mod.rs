//! Cache-aside layer for read statements.
//!
//! Entries are keyed by a hash of the normalized statement and its serialized
//! arguments, namespaced by the first table the statement reads. Every entry is
//! also registered under one tag set per referenced table so a write to that
//! table can drop everything derived from it.

mod redis_store;
mod store;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub use redis_store::RedisStore;
pub use store::{CacheStore, MemoryStore};

use crate::config::CacheConfig;
use crate::error::{PerfError, with_timeout};
use crate::metrics::AppMetrics;
use crate::sql;

const DELETE_BATCH: usize = 500;
const UNTAGGED_NAMESPACE: &str = "query";

/// Stored form of a cached result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQueryEntry {
    pub data: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub tags: Vec<String>,
    pub access_count: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub invalidated_keys: u64,
    pub hit_ratio: f64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    invalidated: AtomicU64,
}

pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    prefix: String,
    default_ttl: Duration,
    tag_ttl_grace: Duration,
    op_timeout: Duration,
    counters: Counters,
    metrics: Option<AppMetrics>,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            prefix: config.prefix.trim_end_matches(':').to_string(),
            default_ttl: config.default_ttl,
            tag_ttl_grace: config.tag_ttl_grace,
            op_timeout: config.op_timeout,
            counters: Counters::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AppMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deterministic key for a statement and its bound arguments.
    pub fn key_for<A>(&self, statement: &str, args: &A) -> Result<String, PerfError>
    where
        A: Serialize + ?Sized,
    {
        let normalized = sql::normalize(statement);
        let encoded_args = serde_json::to_string(args)?;
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(encoded_args.as_bytes());
        let digest = hex::encode(hasher.finalize());
        let namespace = sql::table_hint(statement).unwrap_or_else(|| UNTAGGED_NAMESPACE.into());
        Ok(format!("{}:{}:{}", self.prefix, namespace, digest))
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.prefix, tag.to_ascii_lowercase())
    }

    /// Look up a cached result. Misses and backend failures both return `None`.
    pub async fn get<T, A>(&self, statement: &str, args: &A) -> Option<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let key = match self.key_for(statement, args) {
            Ok(key) => key,
            Err(err) => {
                self.record_error("get", &err);
                self.record_miss();
                return None;
            }
        };

        let raw = match with_timeout("cache get", self.op_timeout, self.store.get(&key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.record_miss();
                return None;
            }
            Err(err) => {
                self.record_error("get", &err);
                self.record_miss();
                return None;
            }
        };

        let entry: CachedQueryEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                self.record_error("decode", &err.into());
                self.record_miss();
                return None;
            }
        };
        let value = match serde_json::from_value::<T>(entry.data.clone()) {
            Ok(value) => value,
            Err(err) => {
                self.record_error("decode", &err.into());
                self.record_miss();
                return None;
            }
        };

        self.record_hit();
        self.spawn_access_bump(key, entry);
        Some(value)
    }

    /// Store a result under its statement key and register it with every referenced table.
    pub async fn set<T, A>(
        &self,
        statement: &str,
        args: &A,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), PerfError>
    where
        T: Serialize + ?Sized,
        A: Serialize + ?Sized,
    {
        let result = self.try_set(statement, args, value, ttl).await;
        match &result {
            Ok(()) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.record_error("set", err),
        }
        result
    }

    async fn try_set<T, A>(
        &self,
        statement: &str,
        args: &A,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), PerfError>
    where
        T: Serialize + ?Sized,
        A: Serialize + ?Sized,
    {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let key = self.key_for(statement, args)?;
        let tags = sql::referenced_tables(statement);
        let entry = CachedQueryEntry {
            data: serde_json::to_value(value)?,
            cached_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            tags: tags.clone(),
            access_count: 0,
        };
        let encoded = serde_json::to_string(&entry)?;

        // Tags go first: an entry must never be readable without being reachable from
        // every table it was derived from.
        let tag_ttl = ttl + self.tag_ttl_grace;
        for tag in &tags {
            let tag_key = self.tag_key(tag);
            with_timeout(
                "cache tag",
                self.op_timeout,
                self.store.add_to_set(&tag_key, &key, tag_ttl),
            )
            .await?;
        }

        with_timeout("cache set", self.op_timeout, self.store.set_ex(&key, &encoded, ttl)).await?;
        debug!(key = %key, tags = ?tags, ttl_secs = ttl.as_secs(), "cached query result");
        Ok(())
    }

    /// Serve from cache, or run `load` and cache its result on success.
    ///
    /// A failed `set` is logged and does not affect the returned value.
    pub async fn get_or_load<T, A, E, F, Fut>(
        &self,
        statement: &str,
        args: &A,
        ttl: Option<Duration>,
        load: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(statement, args).await {
            return Ok(hit);
        }
        let value = load().await?;
        let _ = self.set(statement, args, &value, ttl).await;
        Ok(value)
    }

    /// Drop every entry registered under any of `tags`, plus the tag sets themselves.
    pub async fn invalidate_by_tags(&self, tags: &[&str]) -> Result<u64, PerfError> {
        let result = self.try_invalidate(tags).await;
        match &result {
            Ok(removed) => {
                self.counters.invalidated.fetch_add(*removed, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.add_cache_invalidations(*removed);
                }
                debug!(tags = ?tags, removed, "invalidated cache tags");
            }
            Err(err) => self.record_error("invalidate", err),
        }
        result
    }

    async fn try_invalidate(&self, tags: &[&str]) -> Result<u64, PerfError> {
        let mut doomed: HashSet<String> = HashSet::new();
        let mut tag_keys = Vec::with_capacity(tags.len());
        for tag in tags {
            let tag_key = self.tag_key(tag);
            let members = with_timeout(
                "cache tag members",
                self.op_timeout,
                self.store.set_members(&tag_key),
            )
            .await?;
            doomed.extend(members);
            tag_keys.push(tag_key);
        }

        let entries: Vec<String> = doomed.into_iter().collect();
        let mut removed = 0;
        for chunk in entries.chunks(DELETE_BATCH) {
            removed += with_timeout("cache delete", self.op_timeout, self.store.delete(chunk)).await?;
        }
        if !tag_keys.is_empty() {
            with_timeout("cache delete", self.op_timeout, self.store.delete(&tag_keys)).await?;
        }
        Ok(removed)
    }

    pub async fn invalidate_by_table(&self, table: &str) -> Result<u64, PerfError> {
        self.invalidate_by_tags(&[table]).await
    }

    /// Invalidate every table a write statement touches. Reads are ignored.
    pub async fn invalidate_for_statement(&self, statement: &str) -> Result<u64, PerfError> {
        if !sql::statement_kind(statement).is_write() {
            return Ok(0);
        }
        let tables = sql::referenced_tables(statement);
        if tables.is_empty() {
            warn!(
                statement = %sql::sanitize(statement),
                "write statement names no table; nothing invalidated"
            );
            return Ok(0);
        }
        let tags: Vec<&str> = tables.iter().map(String::as_str).collect();
        self.invalidate_by_tags(&tags).await
    }

    /// Delete every key under the configured prefix.
    pub async fn clear(&self) -> Result<u64, PerfError> {
        let pattern = format!("{}:", self.prefix);
        let result = async {
            let keys = with_timeout(
                "cache scan",
                self.op_timeout,
                self.store.keys_with_prefix(&pattern),
            )
            .await?;
            let mut removed = 0;
            for chunk in keys.chunks(DELETE_BATCH) {
                removed +=
                    with_timeout("cache delete", self.op_timeout, self.store.delete(chunk)).await?;
            }
            Ok(removed)
        }
        .await;
        if let Err(err) = &result {
            self.record_error("clear", err);
        }
        result
    }

    pub async fn ping(&self) -> Result<(), PerfError> {
        with_timeout("cache ping", self.op_timeout, self.store.ping()).await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            invalidated_keys: self.counters.invalidated.load(Ordering::Relaxed),
            hit_ratio: hit_ratio(hits, misses),
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        self.stats().hit_ratio
    }

    fn spawn_access_bump(&self, key: String, mut entry: CachedQueryEntry) {
        let store = Arc::clone(&self.store);
        let limit = self.op_timeout;
        entry.access_count += 1;
        tokio::spawn(async move {
            let encoded = match serde_json::to_string(&entry) {
                Ok(encoded) => encoded,
                Err(_) => return,
            };
            if let Err(err) = with_timeout("cache touch", limit, store.overwrite(&key, &encoded)).await {
                debug!(key = %key, error = %err, "failed to bump cache access count");
            }
        });
    }

    fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.inc_cache_hit();
        }
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.inc_cache_miss();
        }
    }

    fn record_error(&self, operation: &str, err: &PerfError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.inc_cache_error(operation);
        }
        warn!(operation, error = %err, "query cache operation failed");
    }
}

/// hits / (hits + misses) as a percentage; zero before the first lookup.
pub fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (Arc<MemoryStore>, QueryCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = QueryCache::new(store.clone(), &CacheConfig::default());
        (store, cache)
    }

    #[test]
    fn keys_ignore_case_and_whitespace() {
        let (_, cache) = cache();
        let a = cache
            .key_for("SELECT * FROM recipes WHERE id = $1", &[7])
            .expect("key");
        let b = cache
            .key_for("select *\n  from RECIPES where id = $1", &[7])
            .expect("key");
        let c = cache
            .key_for("SELECT * FROM recipes WHERE id = $1", &[8])
            .expect("key");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("pgperf:qc:recipes:"));
    }

    #[test]
    fn statements_without_tables_use_generic_namespace() {
        let (_, cache) = cache();
        let key = cache.key_for("SELECT 1", &()).expect("key");
        assert!(key.starts_with("pgperf:qc:query:"));
    }

    #[tokio::test]
    async fn round_trip_returns_stored_value() {
        let (_, cache) = cache();
        let rows = vec![("pasta".to_string(), 4_i64)];
        cache
            .set("SELECT name, rating FROM recipes", &(), &rows, None)
            .await
            .expect("set");
        let hit: Option<Vec<(String, i64)>> =
            cache.get("SELECT name, rating FROM recipes", &()).await;
        assert_eq!(hit, Some(rows));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn offline_backend_degrades_to_miss() {
        let (store, cache) = cache();
        store.set_offline(true);
        let hit: Option<i64> = cache.get("SELECT count(*) FROM users", &()).await;
        assert!(hit.is_none());
        assert!(cache.set("SELECT count(*) FROM users", &(), &3, None).await.is_err());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.errors, 2);
    }

    #[tokio::test]
    async fn get_or_load_populates_on_miss() {
        let (_, cache) = cache();
        let mut calls = 0;
        let first: Result<i64, PerfError> = cache
            .get_or_load("SELECT count(*) FROM users", &(), None, || {
                calls += 1;
                async { Ok(42) }
            })
            .await;
        assert_eq!(first.expect("load"), 42);
        let second: Result<i64, PerfError> = cache
            .get_or_load("SELECT count(*) FROM users", &(), None, || async { Ok(0) })
            .await;
        assert_eq!(second.expect("hit"), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn write_statements_invalidate_their_tables() {
        let (_, cache) = cache();
        cache
            .set("SELECT * FROM recipes r JOIN users u ON u.id = r.author_id", &(), &1, None)
            .await
            .expect("set");
        let removed = cache
            .invalidate_for_statement("UPDATE users SET name = $1 WHERE id = $2")
            .await
            .expect("invalidate");
        assert_eq!(removed, 1);
        let hit: Option<i64> = cache
            .get("SELECT * FROM recipes r JOIN users u ON u.id = r.author_id", &())
            .await;
        assert!(hit.is_none());
        assert_eq!(
            cache
                .invalidate_for_statement("SELECT * FROM users")
                .await
                .expect("read"),
            0
        );
    }

    #[tokio::test]
    async fn clear_only_touches_prefix() {
        let (store, cache) = cache();
        store
            .set_ex("other:key", "x", Duration::from_secs(60))
            .await
            .expect("set");
        cache
            .set("SELECT * FROM recipes", &(), &1, None)
            .await
            .expect("set");
        let removed = cache.clear().await.expect("clear");
        assert_eq!(removed, 2);
        assert_eq!(store.get("other:key").await.expect("get"), Some("x".into()));
    }

    /// Delegates to a `MemoryStore` but refuses to maintain tag sets.
    struct UntaggableStore(MemoryStore);

    #[async_trait::async_trait]
    impl CacheStore for UntaggableStore {
        async fn get(&self, key: &str) -> Result<Option<String>, PerfError> {
            self.0.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PerfError> {
            self.0.set_ex(key, value, ttl).await
        }

        async fn overwrite(&self, key: &str, value: &str) -> Result<bool, PerfError> {
            self.0.overwrite(key, value).await
        }

        async fn add_to_set(&self, _key: &str, _member: &str, _ttl: Duration) -> Result<(), PerfError> {
            Err(PerfError::Cache("SADD refused".into()))
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, PerfError> {
            self.0.set_members(key).await
        }

        async fn delete(&self, keys: &[String]) -> Result<u64, PerfError> {
            self.0.delete(keys).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PerfError> {
            self.0.keys_with_prefix(prefix).await
        }

        async fn ping(&self) -> Result<(), PerfError> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn failed_tagging_leaves_nothing_readable() {
        let store = Arc::new(UntaggableStore(MemoryStore::new()));
        let cache = QueryCache::new(store.clone(), &CacheConfig::default());

        assert!(cache.set("SELECT * FROM recipes", &(), &1, None).await.is_err());
        assert!(store.0.is_empty());

        cache.invalidate_by_table("recipes").await.expect("invalidate");
        let hit: Option<i64> = cache.get("SELECT * FROM recipes", &()).await;
        assert!(hit.is_none());
        assert_eq!(cache.stats().sets, 0);
    }

    #[test]
    fn hit_ratio_is_zero_without_lookups() {
        assert_eq!(hit_ratio(0, 0), 0.0);
        assert_eq!(hit_ratio(9, 1), 90.0);
    }
}
