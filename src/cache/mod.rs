/// Query result cache
///
/// Results are stored under a fingerprint of the statement and its bound
/// arguments. Miss, disabled and size-exceeded are reported as distinct
/// `CacheError` conditions so callers never confuse them with connectivity faults.
pub mod memory;

pub use memory::MemoryBackend;

use crate::core::Value;
use crate::error::{CacheError, CompuertaError, CompuertaResult};
use crate::utils::{glob_match, BackgroundTask};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Storage behind the query cache
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Stored bytes, or `CacheError::Miss` when absent or expired
    async fn get(&self, key: &str) -> CompuertaResult<Vec<u8>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CompuertaResult<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> CompuertaResult<bool>;

    /// Delete keys matching a glob pattern, returning how many were removed
    async fn delete_pattern(&self, pattern: &str) -> CompuertaResult<usize>;

    async fn exists(&self, key: &str) -> CompuertaResult<bool>;

    async fn clear(&self) -> CompuertaResult<()>;
}

/// TTL override for queries matching a pattern
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationRule {
    pub pattern: String,
    pub ttl: Duration,
}

impl InvalidationRule {
    pub fn new(pattern: &str, ttl: Duration) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
            ttl,
        }
    }

    /// Case-insensitive match. Patterns with `*` or `?` are globs, others substrings.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        if self.pattern.contains(['*', '?']) {
            glob_match(&self.pattern, &query)
        } else {
            query.contains(&self.pattern)
        }
    }
}

/// Query cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Prefix of every key
    pub namespace: String,
    pub default_ttl: Duration,
    /// Byte budget of the backend and largest storable payload
    pub max_size: usize,
    pub sweep_interval: Duration,
    /// First matching rule overrides `default_ttl`
    pub rules: Vec<InvalidationRule>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "compuerta".to_string(),
            default_ttl: Duration::from_secs(300),
            max_size: 100 * 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// Read-through cache for query results
pub struct QueryCache {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    counters: CacheCounters,
    /// Table name to keys stored for it
    tags: RwLock<HashMap<String, HashSet<String>>>,
    pruner: Mutex<Option<BackgroundTask>>,
}

impl QueryCache {
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            config,
            backend,
            counters: CacheCounters::default(),
            tags: RwLock::new(HashMap::new()),
            pruner: Mutex::new(None),
        }
    }

    /// Cache backed by a `MemoryBackend` sized from the config
    pub fn in_memory(config: CacheConfig) -> (Self, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new(config.max_size));
        let cache = Self::new(config, backend.clone());
        (cache, backend)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// `{namespace}:{first 16 hex chars of sha256(query ‖ json(arg)...)}`
    pub fn generate_key(&self, query: &str, args: &[Value]) -> CompuertaResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        for arg in args {
            let encoded = serde_json::to_vec(arg).map_err(CacheError::from)?;
            hasher.update(&encoded);
        }
        let digest = hex::encode(hasher.finalize());
        Ok(format!("{}:{}", self.config.namespace, &digest[..16]))
    }

    /// TTL for a query: first matching rule, else the default
    pub fn ttl_for(&self, query: &str) -> Duration {
        self.config
            .rules
            .iter()
            .find(|rule| rule.matches(query))
            .map_or(self.config.default_ttl, |rule| rule.ttl)
    }

    /// Cached result for a query
    pub async fn get<T: DeserializeOwned>(&self, query: &str, args: &[Value]) -> CompuertaResult<T> {
        if !self.config.enabled {
            return Err(CacheError::Disabled.into());
        }

        let key = self.generate_key(query, args)?;
        let bytes = match self.backend.get(&key).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_cache_miss() => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                if let Err(delete_err) = self.backend.delete(&key).await {
                    warn!(key = %key, error = %delete_err, "Failed to drop undecodable cache entry");
                }
                Err(CacheError::Serialization(e).into())
            }
        }
    }

    /// Store a result. A no-op when caching is disabled.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        query: &str,
        value: &T,
        args: &[Value],
    ) -> CompuertaResult<()> {
        self.store(query, value, args).await.map(|_| ())
    }

    /// Store a result tagged with the tables it reads
    pub async fn set_for_tables<T: Serialize + ?Sized>(
        &self,
        query: &str,
        value: &T,
        args: &[Value],
        tables: &[&str],
    ) -> CompuertaResult<()> {
        let Some(key) = self.store(query, value, args).await? else {
            return Ok(());
        };

        let mut tags = self.tags.write().await;
        for table in tables {
            tags.entry(table.to_lowercase())
                .or_default()
                .insert(key.clone());
        }
        Ok(())
    }

    async fn store<T: Serialize + ?Sized>(
        &self,
        query: &str,
        value: &T,
        args: &[Value],
    ) -> CompuertaResult<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let bytes = serde_json::to_vec(value).map_err(|e| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            CompuertaError::from(CacheError::Serialization(e))
        })?;
        if bytes.len() > self.config.max_size {
            return Err(CacheError::SizeExceeded {
                size: bytes.len(),
                max: self.config.max_size,
            }
            .into());
        }

        let key = self.generate_key(query, args)?;
        let ttl = self.ttl_for(query);
        if let Err(e) = self.backend.set(&key, bytes, ttl).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        Ok(Some(key))
    }

    /// Return the cached value, or fetch, store and return it.
    /// The fetcher only runs when the cache cannot answer.
    pub async fn get_or_set<T, F, Fut>(&self, query: &str, args: &[Value], fetcher: F) -> CompuertaResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CompuertaResult<T>>,
    {
        match self.get(query, args).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cache_miss() => {}
            Err(CompuertaError::Cache(CacheError::Disabled)) => return fetcher().await,
            Err(e) => debug!(error = %e, "Cache read failed, fetching"),
        }

        let value = fetcher().await?;
        if let Err(e) = self.set(query, &value, args).await {
            debug!(error = %e, "Cache store after fetch failed");
        }
        Ok(value)
    }

    /// Drop the entry for one query and argument list
    pub async fn invalidate(&self, query: &str, args: &[Value]) -> CompuertaResult<bool> {
        let key = self.generate_key(query, args)?;
        self.invalidate_key(&key).await
    }

    pub async fn invalidate_key(&self, key: &str) -> CompuertaResult<bool> {
        let removed = self.backend.delete(key).await?;
        let mut tags = self.tags.write().await;
        for keys in tags.values_mut() {
            keys.remove(key);
        }
        tags.retain(|_, keys| !keys.is_empty());
        drop(tags);

        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(removed)
    }

    /// Drop every key matching a glob pattern
    pub async fn invalidate_pattern(&self, pattern: &str) -> CompuertaResult<usize> {
        let removed = self.backend.delete_pattern(pattern).await?;
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(pattern = %pattern, removed, "Invalidated cache pattern");
        if removed > 0 {
            self.prune_tags().await?;
        }
        Ok(removed)
    }

    /// Forget tagged keys the backend no longer holds, returning how many
    /// were dropped. Expired and evicted entries leave tags behind until this runs.
    pub async fn prune_tags(&self) -> CompuertaResult<usize> {
        let tagged: HashSet<String> = self
            .tags
            .read()
            .await
            .values()
            .flatten()
            .cloned()
            .collect();

        let mut candidates = Vec::new();
        for key in tagged {
            if !self.backend.exists(&key).await? {
                candidates.push(key);
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        // Re-check under the write lock so a concurrent store keeps its tags
        let mut tags = self.tags.write().await;
        let mut dead = HashSet::new();
        for key in candidates {
            if !self.backend.exists(&key).await? {
                dead.insert(key);
            }
        }
        for keys in tags.values_mut() {
            keys.retain(|k| !dead.contains(k));
        }
        tags.retain(|_, keys| !keys.is_empty());

        if !dead.is_empty() {
            debug!(pruned = dead.len(), "Pruned stale cache tags");
        }
        Ok(dead.len())
    }

    /// Distinct keys currently tracked under any table tag
    pub async fn tagged_key_count(&self) -> usize {
        self.tags
            .read()
            .await
            .values()
            .flatten()
            .collect::<HashSet<_>>()
            .len()
    }

    /// Periodically prune tags of expired or evicted entries
    pub async fn start_tag_pruner(self: &Arc<Self>, interval: Duration) {
        let mut pruner = self.pruner.lock().await;
        if pruner.as_ref().is_some_and(|task| task.is_running()) {
            return;
        }

        let cache = Arc::clone(self);
        *pruner = Some(BackgroundTask::spawn_periodic(
            "cache-tag-pruner",
            interval,
            move || {
                let cache = Arc::clone(&cache);
                async move {
                    if let Err(e) = cache.prune_tags().await {
                        warn!(error = %e, "Cache tag pruning failed");
                    }
                }
            },
        ));
        info!(interval = ?interval, "Started cache tag pruner");
    }

    pub async fn stop_tag_pruner(&self) {
        if let Some(task) = self.pruner.lock().await.take() {
            task.stop().await;
        }
    }

    /// Drop entries stored for a table, plus keys matching `*table*`
    pub async fn invalidate_table(&self, table: &str) -> CompuertaResult<usize> {
        let tagged = self
            .tags
            .write()
            .await
            .remove(&table.to_lowercase())
            .unwrap_or_default();

        let mut removed = 0;
        for key in &tagged {
            if self.backend.delete(key).await? {
                removed += 1;
            }
        }
        removed += self.backend.delete_pattern(&format!("*{table}*")).await?;

        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(table = %table, removed, "Invalidated cache entries for table");
        Ok(removed)
    }

    /// Flush everything
    pub async fn clear(&self) -> CompuertaResult<()> {
        self.backend.clear().await?;
        self.tags.write().await.clear();
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheMetrics {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    pub fn reset_metrics(&self) {
        for counter in [
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.sets,
            &self.counters.errors,
            &self.counters.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
