/// Key-based sharding across independent databases
pub mod hash;
pub mod ring;
pub mod router;

pub use hash::HashFunction;
pub use ring::HashRing;
pub use router::{ShardRange, ShardRouter, ShardingStrategy};

use crate::core::{ConnectionHandle, ExecResult, Rows, Transaction, TxOptions, Value};
use crate::error::{CompuertaError, CompuertaResult};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Shard manager configuration
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub strategy: ShardingStrategy,
    pub hash_function: HashFunction,
    pub virtual_nodes: usize,
    pub enable_cross_shard: bool,
    /// Concurrent shard calls allowed during fan-out
    pub max_cross_shard_queries: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            strategy: ShardingStrategy::ConsistentHash,
            hash_function: HashFunction::Crc32,
            virtual_nodes: 150,
            enable_cross_shard: true,
            max_cross_shard_queries: 10,
        }
    }
}

/// One shard and its running counters
pub struct Shard {
    pub id: u32,
    pub name: String,
    pub weight: u32,
    pub region: Option<String>,
    connection: ConnectionHandle,
    active: AtomicBool,
    query_count: AtomicU64,
    error_count: AtomicU64,
}

impl Shard {
    pub fn new(id: u32, name: &str, connection: ConnectionHandle) -> Self {
        Self {
            id,
            name: name.to_string(),
            weight: 1,
            region: None,
            connection,
            active: AtomicBool::new(true),
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight.max(1) as u32;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> ConnectionHandle {
        Arc::clone(&self.connection)
    }

    fn record(&self, failed: bool) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> ShardStats {
        ShardStats {
            id: self.id,
            name: self.name.clone(),
            region: self.region.clone(),
            weight: self.weight,
            active: self.is_active(),
            query_count: self.query_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Counters snapshot for one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub id: u32,
    pub name: String,
    pub region: Option<String>,
    pub weight: u32,
    pub active: bool,
    pub query_count: u64,
    pub error_count: u64,
}

/// Outcome of one shard during fan-out
#[derive(Debug)]
pub struct ShardResult {
    pub shard_id: u32,
    pub result: CompuertaResult<Rows>,
}

struct ShardState {
    router: ShardRouter,
    shards: HashMap<u32, Arc<Shard>>,
}

/// Routes requests to shards and fans out across them
pub struct ShardManager {
    config: ShardConfig,
    state: RwLock<ShardState>,
    fan_out: Arc<Semaphore>,
}

impl ShardManager {
    pub fn new(config: ShardConfig) -> Self {
        let router = ShardRouter::new(config.strategy, config.hash_function, config.virtual_nodes);
        let fan_out = Arc::new(Semaphore::new(config.max_cross_shard_queries.max(1)));
        Self {
            config,
            state: RwLock::new(ShardState {
                router,
                shards: HashMap::new(),
            }),
            fan_out,
        }
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub async fn add_shard(&self, shard: Shard) -> CompuertaResult<()> {
        let mut state = self.state.write().await;
        state.router.add_shard(shard.id, &shard.name)?;
        info!(shard_id = shard.id, shard = %shard.name, region = ?shard.region, "Added shard");
        state.shards.insert(shard.id, Arc::new(shard));
        Ok(())
    }

    /// Remove a shard and its routes. The connection is left open for the caller.
    pub async fn remove_shard(&self, id: u32) -> CompuertaResult<Arc<Shard>> {
        let mut state = self.state.write().await;
        state.router.remove_shard(id)?;
        let shard = state
            .shards
            .remove(&id)
            .ok_or_else(|| CompuertaError::shard(format!("shard {id} not found")))?;
        info!(shard_id = id, shard = %shard.name, "Removed shard");
        Ok(shard)
    }

    pub async fn add_range(&self, min: &str, max: &str, shard_id: u32) -> CompuertaResult<()> {
        self.state.write().await.router.add_range(min, max, shard_id)
    }

    pub async fn add_lookup(&self, key: &str, shard_id: u32) -> CompuertaResult<()> {
        self.state.write().await.router.add_lookup(key, shard_id)
    }

    pub async fn set_shard_active(&self, id: u32, active: bool) -> CompuertaResult<()> {
        let state = self.state.read().await;
        let shard = state
            .shards
            .get(&id)
            .ok_or_else(|| CompuertaError::shard(format!("shard {id} not found")))?;
        if shard.active.swap(active, Ordering::AcqRel) != active {
            info!(shard_id = id, active, "Shard state changed");
        }
        Ok(())
    }

    /// Resolve a key to its active shard
    pub async fn get_shard(&self, key: &str) -> CompuertaResult<Arc<Shard>> {
        let state = self.state.read().await;
        let id = state.router.route(key)?;
        let shard = state
            .shards
            .get(&id)
            .ok_or_else(|| CompuertaError::shard(format!("shard {id} not found")))?;

        if !shard.is_active() {
            return Err(CompuertaError::shard(format!(
                "shard {} ({}) is not active",
                id, shard.name
            )));
        }
        Ok(Arc::clone(shard))
    }

    /// Run a query on the shard owning `key`
    pub async fn execute_on_shard(
        &self,
        key: &str,
        sql: &str,
        args: &[Value],
    ) -> CompuertaResult<Rows> {
        let shard = self.get_shard(key).await?;
        let result = shard.connection.query(sql, args).await;
        shard.record(result.is_err());
        if let Err(e) = &result {
            debug!(shard_id = shard.id, error = %e, "Shard query failed");
        }
        result
    }

    /// Run a write statement on the shard owning `key`
    pub async fn exec_on_shard(
        &self,
        key: &str,
        sql: &str,
        args: &[Value],
    ) -> CompuertaResult<ExecResult> {
        let shard = self.get_shard(key).await?;
        let result = shard.connection.exec(sql, args).await;
        shard.record(result.is_err());
        result
    }

    /// Query every active shard concurrently. One result per shard, ordered by id;
    /// a failing shard does not abort the others.
    pub async fn execute_on_all_shards(
        &self,
        sql: &str,
        args: &[Value],
    ) -> CompuertaResult<Vec<ShardResult>> {
        if !self.config.enable_cross_shard {
            return Err(CompuertaError::shard("cross-shard queries are disabled"));
        }

        let mut shards: Vec<Arc<Shard>> = {
            let state = self.state.read().await;
            state
                .shards
                .values()
                .filter(|s| s.is_active())
                .cloned()
                .collect()
        };
        shards.sort_by_key(|s| s.id);

        let calls = shards.into_iter().map(|shard| {
            let permits = Arc::clone(&self.fan_out);
            async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => shard.connection.query(sql, args).await,
                    Err(_) => Err(CompuertaError::internal("fan-out semaphore closed")),
                };
                shard.record(result.is_err());
                if let Err(e) = &result {
                    warn!(shard_id = shard.id, error = %e, "Cross-shard query failed on shard");
                }
                ShardResult {
                    shard_id: shard.id,
                    result,
                }
            }
        });

        Ok(join_all(calls).await)
    }

    /// Run `f` inside a transaction on the shard owning `key`.
    ///
    /// Commits when `f` succeeds and rolls back when it fails. A panic in `f`
    /// rolls back and then resumes unwinding.
    pub async fn execute_on_shard_tx<F, T>(&self, key: &str, f: F) -> CompuertaResult<T>
    where
        F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, CompuertaResult<T>> + Send,
        T: Send,
    {
        let shard = self.get_shard(key).await?;
        let mut tx = shard.connection.begin_tx(TxOptions::default()).await?;

        let outcome = {
            let tx_ref: &mut dyn Transaction = tx.as_mut();
            AssertUnwindSafe(async move { f(tx_ref).await })
                .catch_unwind()
                .await
        };

        match outcome {
            Ok(Ok(value)) => {
                let committed = tx.commit().await;
                shard.record(committed.is_err());
                committed.map(|_| value)
            }
            Ok(Err(e)) => {
                shard.record(true);
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(shard_id = shard.id, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(shard_id = shard.id, error = %rollback_err, "Rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Counters for every shard, ordered by id
    pub async fn get_shard_stats(&self) -> Vec<ShardStats> {
        let state = self.state.read().await;
        let mut stats: Vec<ShardStats> = state.shards.values().map(|s| s.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    pub async fn shards_in_region(&self, region: &str) -> Vec<u32> {
        let state = self.state.read().await;
        let mut ids: Vec<u32> = state
            .shards
            .values()
            .filter(|s| s.region.as_deref() == Some(region))
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Key count per shard for the current topology
    pub async fn shard_distribution<I, S>(&self, keys: I) -> BTreeMap<u32, usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.state.read().await.router.distribution(keys)
    }

    pub async fn shard_count(&self) -> usize {
        self.state.read().await.shards.len()
    }

    /// Close every shard connection, collecting failures
    pub async fn close_all(&self) -> CompuertaResult<()> {
        let shards: Vec<Arc<Shard>> = self.state.read().await.shards.values().cloned().collect();
        let mut failures = Vec::new();
        for shard in shards {
            if let Err(e) = shard.connection.close().await {
                failures.push(format!("{}: {}", shard.name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CompuertaError::CloseFailed {
                count: failures.len(),
                details: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{FailureMode, MockConnection};
    use std::time::Duration;

    async fn manager_with(
        config: ShardConfig,
        count: u32,
    ) -> (ShardManager, Vec<Arc<MockConnection>>) {
        let manager = ShardManager::new(config);
        let mut conns = Vec::new();
        for id in 0..count {
            let conn = MockConnection::arc(&format!("shard-{id}"));
            let region = if id % 2 == 0 { "eu" } else { "us" };
            manager
                .add_shard(
                    Shard::new(id, &format!("shard-{id}"), conn.clone())
                        .with_region(Some(region.to_string())),
                )
                .await
                .unwrap();
            conns.push(conn);
        }
        (manager, conns)
    }

    fn source(rows: &Rows) -> String {
        match rows.get(0, "source") {
            Some(Value::Text(s)) => s.clone(),
            other => panic!("unexpected row {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_shard_is_stable() {
        let (manager, _) = manager_with(ShardConfig::default(), 3).await;
        for i in 0..50 {
            let key = format!("order:{i}");
            let a = manager.get_shard(&key).await.unwrap().id;
            let b = manager.get_shard(&key).await.unwrap().id;
            assert_eq!(a, b);
        }
    }

    #[tokio::test]
    async fn test_inactive_shard_is_an_error() {
        let (manager, _) = manager_with(ShardConfig::default(), 3).await;
        let id = manager.get_shard("customer:7").await.unwrap().id;
        manager.set_shard_active(id, false).await.unwrap();
        assert!(matches!(
            manager.get_shard("customer:7").await,
            Err(CompuertaError::Shard { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_shards_is_an_error() {
        let manager = ShardManager::new(ShardConfig::default());
        assert!(manager.get_shard("k").await.is_err());
    }

    #[tokio::test]
    async fn test_execute_on_shard_counts_queries() {
        let (manager, conns) = manager_with(ShardConfig::default(), 3).await;
        let id = manager.get_shard("user:1").await.unwrap().id;

        let rows = manager
            .execute_on_shard("user:1", "SELECT * FROM users", &[])
            .await
            .unwrap();
        assert_eq!(source(&rows), format!("shard-{id}"));

        conns[id as usize].set_failure(FailureMode::Query);
        assert!(manager
            .execute_on_shard("user:1", "SELECT * FROM users", &[])
            .await
            .is_err());

        let stats = manager.get_shard_stats().await;
        assert_eq!(stats[id as usize].query_count, 2);
        assert_eq!(stats[id as usize].error_count, 1);
    }

    #[tokio::test]
    async fn test_fan_out_survives_partial_failure() {
        let (manager, conns) = manager_with(ShardConfig::default(), 3).await;
        conns[1].set_failure(FailureMode::Connection);

        let results = manager
            .execute_on_all_shards("SELECT count(*) FROM orders", &[])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.result.is_ok()).count(), 2);
        assert!(results[1].result.is_err());
        assert_eq!(results[1].shard_id, 1);
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_limit() {
        let config = ShardConfig {
            max_cross_shard_queries: 2,
            ..ShardConfig::default()
        };
        let manager = ShardManager::new(config);
        let shared = MockConnection::arc("shared");
        shared.set_delay(Some(Duration::from_millis(20)));
        for id in 0..6 {
            manager
                .add_shard(Shard::new(id, &format!("shard-{id}"), shared.clone()))
                .await
                .unwrap();
        }

        let results = manager.execute_on_all_shards("SELECT 1", &[]).await.unwrap();
        assert_eq!(results.len(), 6);
        assert!(shared.state.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fan_out_disabled() {
        let config = ShardConfig {
            enable_cross_shard: false,
            ..ShardConfig::default()
        };
        let (manager, _) = manager_with(config, 2).await;
        assert!(manager.execute_on_all_shards("SELECT 1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_fan_out_skips_inactive_shards() {
        let (manager, _) = manager_with(ShardConfig::default(), 3).await;
        manager.set_shard_active(0, false).await.unwrap();
        let results = manager.execute_on_all_shards("SELECT 1", &[]).await.unwrap();
        let ids: Vec<u32> = results.iter().map(|r| r.shard_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_shard_tx_commits_on_success() {
        let (manager, conns) = manager_with(ShardConfig::default(), 2).await;
        let id = manager.get_shard("acct:9").await.unwrap().id as usize;

        let affected = manager
            .execute_on_shard_tx("acct:9", |tx| {
                async move {
                    let result = tx.exec("UPDATE accounts SET balance = 0", &[]).await?;
                    Ok(result.rows_affected)
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(affected, 1);
        assert_eq!(conns[id].state.commits.load(Ordering::SeqCst), 1);
        assert_eq!(conns[id].state.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shard_tx_rolls_back_on_error() {
        let (manager, conns) = manager_with(ShardConfig::default(), 2).await;
        let id = manager.get_shard("acct:9").await.unwrap().id as usize;

        let result: CompuertaResult<()> = manager
            .execute_on_shard_tx("acct:9", |_tx| {
                async move { Err(CompuertaError::query("constraint violated")) }.boxed()
            })
            .await;

        assert!(result.is_err());
        assert_eq!(conns[id].state.commits.load(Ordering::SeqCst), 0);
        assert_eq!(conns[id].state.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shard_tx_rolls_back_then_repanics() {
        let (manager, conns) = manager_with(ShardConfig::default(), 2).await;
        let id = manager.get_shard("acct:9").await.unwrap().id as usize;

        let outcome = AssertUnwindSafe(manager.execute_on_shard_tx("acct:9", |_tx| {
            async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            }
            .boxed()
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(conns[id].state.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(conns[id].state.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_shard_and_regions() {
        let (manager, _) = manager_with(ShardConfig::default(), 4).await;
        assert_eq!(manager.shards_in_region("eu").await, vec![0, 2]);

        let removed = manager.remove_shard(2).await.unwrap();
        assert_eq!(removed.name, "shard-2");
        assert_eq!(manager.shard_count().await, 3);
        assert_eq!(manager.shards_in_region("eu").await, vec![0]);
        for i in 0..100 {
            assert_ne!(manager.get_shard(&format!("k{i}")).await.unwrap().id, 2);
        }
    }

    #[tokio::test]
    async fn test_end_to_end_distribution() {
        let (manager, _) = manager_with(ShardConfig::default(), 3).await;
        let keys: Vec<String> = (0..1000).map(|i| format!("customer-{i}")).collect();
        let counts = manager.shard_distribution(&keys).await;

        assert_eq!(counts.len(), 3);
        for (id, count) in counts {
            assert!(
                (100..=400).contains(&count),
                "shard {id} holds {count} of 1000 keys"
            );
        }
    }

    #[tokio::test]
    async fn test_range_and_lookup_through_manager() {
        let config = ShardConfig {
            strategy: ShardingStrategy::Lookup,
            ..ShardConfig::default()
        };
        let (manager, _) = manager_with(config, 2).await;
        manager.add_lookup("tenant-a", 1).await.unwrap();
        assert_eq!(manager.get_shard("tenant-a").await.unwrap().id, 1);
        assert!(manager.get_shard("tenant-b").await.is_err());
        assert!(manager.add_lookup("tenant-c", 9).await.is_err());

        let config = ShardConfig {
            strategy: ShardingStrategy::Range,
            ..ShardConfig::default()
        };
        let (manager, _) = manager_with(config, 2).await;
        manager.add_range("0", "5", 0).await.unwrap();
        manager.add_range("5", "9", 1).await.unwrap();
        assert_eq!(manager.get_shard("42").await.unwrap().id, 0);
        assert_eq!(manager.get_shard("77").await.unwrap().id, 1);
    }
}
