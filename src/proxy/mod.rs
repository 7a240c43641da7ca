/// Database proxy façade
///
/// Composes the pool, the replica manager and the query cache behind two calls,
/// `query` and `exec`, with per-call timeouts, statement rewriting and metrics.
pub mod rewrite;

pub use rewrite::{apply_rules, classify, QueryKind, RewriteRule};

use crate::cache::QueryCache;
use crate::core::{ConnectionHandle, ExecResult, Rows, Value};
use crate::error::{CacheError, CompuertaError, CompuertaResult, ErrorSeverity};
use crate::pool::PoolManager;
use crate::replica::ReplicaManager;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a read is sent
enum ReadTarget {
    /// A replica chosen by the replica manager
    Replica(String, ConnectionHandle),
    Primary,
    /// Pool-level replica selection, no manager attached
    Pool,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `None` disables the per-call timeout
    pub query_timeout: Option<Duration>,
    pub slow_query_threshold: Duration,
    pub enable_load_balancing: bool,
    pub enable_query_rewrite: bool,
    pub rewrite_rules: Vec<RewriteRule>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            query_timeout: Some(Duration::from_secs(30)),
            slow_query_threshold: Duration::from_secs(1),
            enable_load_balancing: true,
            enable_query_rewrite: false,
            rewrite_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ProxyCounters {
    total: AtomicU64,
    slow: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    total_micros: AtomicU64,
}

/// Proxy metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProxyMetrics {
    pub total_queries: u64,
    pub slow_queries: u64,
    pub failed_queries: u64,
    pub cache_hits: u64,
    pub average_duration: Duration,
}

/// The entry point applications call
pub struct DatabaseProxy {
    config: ProxyConfig,
    pool: Arc<PoolManager>,
    replicas: Option<Arc<ReplicaManager>>,
    cache: Option<Arc<QueryCache>>,
    rules: RwLock<Vec<RewriteRule>>,
    counters: ProxyCounters,
}

impl DatabaseProxy {
    pub fn new(config: ProxyConfig, pool: Arc<PoolManager>) -> Self {
        let rules = RwLock::new(config.rewrite_rules.clone());
        Self {
            config,
            pool,
            replicas: None,
            cache: None,
            rules,
            counters: ProxyCounters::default(),
        }
    }

    pub fn with_replica_manager(mut self, replicas: Arc<ReplicaManager>) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn replica_manager(&self) -> Option<&Arc<ReplicaManager>> {
        self.replicas.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<QueryCache>> {
        self.cache.as_ref()
    }

    pub async fn query(&self, sql: &str, args: &[Value]) -> CompuertaResult<Rows> {
        self.query_for_tables(sql, args, &[]).await
    }

    pub async fn exec(&self, sql: &str, args: &[Value]) -> CompuertaResult<ExecResult> {
        self.exec_for_tables(sql, args, &[]).await
    }

    /// Run a statement that returns rows. `tables` tags cached reads and names
    /// what a writing statement invalidates.
    pub async fn query_for_tables(
        &self,
        sql: &str,
        args: &[Value],
        tables: &[&str],
    ) -> CompuertaResult<Rows> {
        let started = Instant::now();
        let result = self
            .with_timeout("query", self.run_query(sql, args, tables))
            .await;
        if let Err(e) = &result {
            self.log_failure(e);
        }
        self.record(started.elapsed(), result.is_err());
        result
    }

    /// Run a write statement on the primary, then invalidate `tables`
    pub async fn exec_for_tables(
        &self,
        sql: &str,
        args: &[Value],
        tables: &[&str],
    ) -> CompuertaResult<ExecResult> {
        let started = Instant::now();
        let result = self
            .with_timeout("exec", self.run_exec(sql, args, tables))
            .await;
        if let Err(e) = &result {
            self.log_failure(e);
        }
        self.record(started.elapsed(), result.is_err());
        result
    }

    async fn with_timeout<T, Fut>(&self, operation: &str, fut: Fut) -> CompuertaResult<T>
    where
        Fut: Future<Output = CompuertaResult<T>>,
    {
        match self.config.query_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| CompuertaError::timeout(format!("{operation} after {limit:?}")))?,
            None => fut.await,
        }
    }

    async fn rewrite(&self, sql: &str) -> String {
        if !self.config.enable_query_rewrite {
            return sql.to_string();
        }
        let rules = self.rules.read().await;
        apply_rules(sql, &rules).into_owned()
    }

    async fn run_query(&self, sql: &str, args: &[Value], tables: &[&str]) -> CompuertaResult<Rows> {
        let sql = self.rewrite(sql).await;

        if classify(&sql) == QueryKind::Write {
            // e.g. INSERT ... RETURNING
            let rows = self.pool.get_for_write().await?.query(&sql, args).await?;
            self.invalidate_tables(tables).await;
            return Ok(rows);
        }

        if let Some(cache) = &self.cache {
            match cache.get::<Rows>(&sql, args).await {
                Ok(rows) => {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(rows);
                }
                Err(CompuertaError::Cache(CacheError::Miss | CacheError::Disabled)) => {}
                Err(e) => debug!(error = %e, "Cache lookup failed"),
            }
        }

        let rows = self.read(&sql, args).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set_for_tables(&sql, &rows, args, tables).await {
                debug!(error = %e, "Cache store failed");
            }
        }
        Ok(rows)
    }

    /// Read from a selected replica, falling back to the primary when the
    /// replica fails with a connectivity error
    async fn read(&self, sql: &str, args: &[Value]) -> CompuertaResult<Rows> {
        match self.select_replica().await {
            ReadTarget::Replica(name, conn) => self.read_replica(&name, conn, sql, args).await,
            ReadTarget::Primary => self.pool.get_for_write().await?.query(sql, args).await,
            ReadTarget::Pool => self.read_pool(sql, args).await,
        }
    }

    async fn read_replica(
        &self,
        name: &str,
        conn: ConnectionHandle,
        sql: &str,
        args: &[Value],
    ) -> CompuertaResult<Rows> {
        let started = Instant::now();
        let result = conn.query(sql, args).await;
        if let Some(replicas) = &self.replicas {
            let recorded = match &result {
                Ok(_) => replicas.record_success(name, started.elapsed()).await,
                Err(e) => replicas.record_failure(name, &e.to_string()).await,
            };
            if let Err(e) = recorded {
                warn!(replica = %name, error = %e, "Failed to record replica outcome");
            }
        }

        match result {
            Err(e) if e.is_retryable() => {
                warn!(replica = %name, error = %e, "Replica read failed, retrying on primary");
                self.pool.get_for_write().await?.query(sql, args).await
            }
            other => other,
        }
    }

    /// Pool-weighted replica read, used when no replica manager decides
    async fn read_pool(&self, sql: &str, args: &[Value]) -> CompuertaResult<Rows> {
        let conn = self.pool.get_for_read().await?;
        match conn.query(sql, args).await {
            Err(e) if e.is_retryable() => {
                let primary = self.pool.get_for_write().await?;
                if Arc::ptr_eq(&conn, &primary) {
                    return Err(e);
                }
                warn!(error = %e, "Pool replica read failed, retrying on primary");
                primary.query(sql, args).await
            }
            other => other,
        }
    }

    async fn select_replica(&self) -> ReadTarget {
        if !self.config.enable_load_balancing {
            return ReadTarget::Pool;
        }
        let Some(replicas) = self.replicas.as_ref() else {
            return ReadTarget::Pool;
        };

        // The manager owns eligibility; never bypass it through the pool
        let name = match replicas.select_replica().await {
            Ok(name) => name,
            Err(e) => {
                debug!(error = %e, "No eligible replica, reading from primary");
                return ReadTarget::Primary;
            }
        };

        match self.pool.get_by_name(&name).await {
            Ok(conn) => ReadTarget::Replica(name, conn),
            Err(e) => {
                debug!(replica = %name, error = %e, "Selected replica not in pool, reading from primary");
                ReadTarget::Primary
            }
        }
    }

    async fn run_exec(&self, sql: &str, args: &[Value], tables: &[&str]) -> CompuertaResult<ExecResult> {
        let sql = self.rewrite(sql).await;
        let result = self.pool.get_for_write().await?.exec(&sql, args).await?;
        self.invalidate_tables(tables).await;
        Ok(result)
    }

    async fn invalidate_tables(&self, tables: &[&str]) {
        let Some(cache) = &self.cache else {
            return;
        };
        for table in tables {
            if let Err(e) = cache.invalidate_table(table).await {
                debug!(table = %table, error = %e, "Cache invalidation failed");
            }
        }
    }

    fn log_failure(&self, err: &CompuertaError) {
        match err.severity() {
            ErrorSeverity::Info => info!(error = %err, "Query failed"),
            ErrorSeverity::Warning => warn!(error = %err, "Query failed"),
            ErrorSeverity::Error | ErrorSeverity::Critical => error!(error = %err, "Query failed"),
        }
    }

    fn record(&self, elapsed: Duration, failed: bool) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if failed {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if elapsed >= self.config.slow_query_threshold {
            self.counters.slow.fetch_add(1, Ordering::Relaxed);
            warn!(duration = ?elapsed, "Slow query");
        }
    }

    pub async fn add_rewrite_rule(&self, rule: RewriteRule) {
        self.rules.write().await.push(rule);
    }

    /// Enable or disable every rule with this pattern; returns whether any matched
    pub async fn set_rewrite_rule_enabled(&self, pattern: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write().await;
        let mut found = false;
        for rule in rules.iter_mut().filter(|r| r.pattern == pattern) {
            rule.enabled = enabled;
            found = true;
        }
        found
    }

    pub async fn rewrite_rules(&self) -> Vec<RewriteRule> {
        self.rules.read().await.clone()
    }

    pub fn get_metrics(&self) -> ProxyMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let micros = self.counters.total_micros.load(Ordering::Relaxed);
        ProxyMetrics {
            total_queries: total,
            slow_queries: self.counters.slow.load(Ordering::Relaxed),
            failed_queries: self.counters.failed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            average_duration: if total == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(micros / total)
            },
        }
    }

    pub fn reset_metrics(&self) {
        for counter in [
            &self.counters.total,
            &self.counters.slow,
            &self.counters.failed,
            &self.counters.cache_hits,
            &self.counters.total_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
