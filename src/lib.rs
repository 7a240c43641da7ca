//! Compuerta - routing and resiliency middleware for relational databases
//!
//! Compuerta sits between an application and its databases:
//! 1. Pool: a primary, weighted replicas and prioritized backups with periodic health checks
//! 2. Replicas: lag-aware load balancing with failover and automatic recovery
//! 3. Shards: key routing by hash modulo, consistent hash, range or lookup, plus fan-out
//! 4. Cache: namespaced query result caching with TTL rules and table invalidation
//! 5. Transactions: managed transactions with savepoints and retry
//!
//! [`DatabaseProxy`] composes the first four behind `query` and `exec`.
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod replica;
pub mod shard;
pub mod txn;
pub mod utils;

pub use crate::cache::{CacheBackend, CacheConfig, QueryCache};
pub use crate::config::Config;
pub use crate::core::{Connection, ConnectionFactory, ConnectionHandle, Rows, Value};
pub use crate::error::{CompuertaError, CompuertaResult};
pub use crate::pool::PoolManager;
pub use crate::proxy::{DatabaseProxy, ProxyConfig};
pub use crate::replica::{ReplicaManager, ReplicaResolver};
pub use crate::shard::{Shard, ShardManager};
pub use crate::txn::{TransactionConfig, TransactionManager};

use crate::cache::memory::MemoryBackend;
use crate::pool::PoolConfig;
use crate::replica::{Dialect, PoolResolver, ReplicaConfig};
use crate::shard::ShardConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A fully wired deployment built from [`Config`]
pub struct Compuerta {
    config: Config,
    pool: Arc<PoolManager>,
    replicas: Arc<ReplicaManager>,
    cache: Arc<QueryCache>,
    cache_backend: Arc<MemoryBackend>,
    proxy: Arc<DatabaseProxy>,
    shards: Option<Arc<ShardManager>>,
    transactions: Option<Arc<TransactionManager>>,
}

impl Compuerta {
    /// Validate the configuration, open every configured connection and wire
    /// the components together. Background tasks are not started.
    pub async fn new(config: Config, factory: Arc<dyn ConnectionFactory>) -> CompuertaResult<Self> {
        config.validate()?;

        let pool = Arc::new(
            PoolManager::new(PoolConfig::from(&config.pool)).with_factory(Arc::clone(&factory)),
        );
        if let Some(primary) = &config.pool.primary {
            pool.set_primary("primary", primary).await?;
        }

        let replicas = Arc::new(ReplicaManager::new(ReplicaConfig::from(&config.replica)));
        for entry in &config.pool.replicas {
            let weight = entry.weight.max(1) as u32;
            pool.add_replica(&entry.name, &entry.database, weight).await?;
            replicas.register_replica(&entry.name, entry.weight).await?;
        }
        for entry in &config.pool.backups {
            pool.add_backup(&entry.name, &entry.database, entry.priority)
                .await?;
        }

        let (cache, cache_backend) = QueryCache::in_memory(CacheConfig::from(&config.cache));
        let cache = Arc::new(cache);

        let proxy = Arc::new(
            DatabaseProxy::new(ProxyConfig::from(&config.proxy), Arc::clone(&pool))
                .with_replica_manager(Arc::clone(&replicas))
                .with_cache(Arc::clone(&cache)),
        );

        let shards = match &config.shard {
            Some(settings) => {
                let manager = ShardManager::new(ShardConfig::from(settings));
                for entry in &settings.shards {
                    let conn = factory.connect(&entry.database).await?;
                    let shard = Shard::new(entry.id, &entry.name, conn)
                        .with_weight(entry.weight)
                        .with_region(entry.region.clone());
                    manager.add_shard(shard).await?;
                }
                for range in &settings.ranges {
                    manager.add_range(&range.min, &range.max, range.shard_id).await?;
                }
                for lookup in &settings.lookups {
                    manager.add_lookup(&lookup.key, lookup.shard_id).await?;
                }
                Some(Arc::new(manager))
            }
            None => None,
        };

        let transactions = if config.pool.primary.is_some() {
            Some(Arc::new(TransactionManager::new(
                pool.get_primary().await?,
                TransactionConfig::from(&config.transaction),
            )))
        } else {
            None
        };

        info!(
            replicas = config.pool.replicas.len(),
            backups = config.pool.backups.len(),
            shards = config.shard.as_ref().map_or(0, |s| s.shards.len()),
            "compuerta initialized"
        );

        Ok(Self {
            config,
            pool,
            replicas,
            cache,
            cache_backend,
            proxy,
            shards,
            transactions,
        })
    }

    /// Start pool health checks, replica monitoring and cache maintenance
    pub async fn start(&self) {
        self.pool.start_health_check().await;

        if !self.config.pool.replicas.is_empty() {
            let dialects: HashMap<String, Dialect> = self
                .config
                .pool
                .replicas
                .iter()
                .map(|r| (r.name.clone(), r.database.dialect))
                .collect();
            let resolver = Arc::new(PoolResolver::new(Arc::clone(&self.pool), dialects));
            self.replicas.start_monitoring(resolver).await;
        }

        if self.cache.is_enabled() {
            let interval = self.cache.config().sweep_interval;
            self.cache_backend.start_sweeper(interval).await;
            self.cache.start_tag_pruner(interval).await;
        }
    }

    /// Stop background work and close every connection
    pub async fn shutdown(&self) -> CompuertaResult<()> {
        self.replicas.stop_monitoring().await;
        self.cache_backend.stop_sweeper().await;
        self.cache.stop_tag_pruner().await;

        let mut result = self.pool.close_all().await;
        if let Some(shards) = &self.shards {
            if let Err(e) = shards.close_all().await {
                warn!(error = %e, "failed to close shard connections");
                result = result.and(Err(e));
            }
        }
        info!("compuerta shut down");
        result
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn replica_manager(&self) -> &Arc<ReplicaManager> {
        &self.replicas
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn proxy(&self) -> &Arc<DatabaseProxy> {
        &self.proxy
    }

    pub fn shard_manager(&self) -> CompuertaResult<&Arc<ShardManager>> {
        self.shards
            .as_ref()
            .ok_or_else(|| CompuertaError::not_configured("shard"))
    }

    /// Transactions run on the primary
    pub fn transaction_manager(&self) -> CompuertaResult<&Arc<TransactionManager>> {
        self.transactions
            .as_ref()
            .ok_or_else(|| CompuertaError::not_configured("primary"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, LookupEntry, ReplicaEntry, ShardEntry, ShardSettings};
    use crate::core::testing::MockFactory;
    use crate::shard::{HashFunction, ShardingStrategy};
    use crate::txn::TransactionOptions;
    use futures::FutureExt;

    fn replicated_config() -> Config {
        let mut config = Config::default();
        config.pool.replicas = vec![ReplicaEntry {
            name: "replica-1".to_string(),
            weight: 2,
            database: DatabaseConfig::new("10.0.0.2", 5432, "app", "app"),
        }];
        config
    }

    fn source(rows: &Rows) -> Option<&Value> {
        rows.get(0, "source")
    }

    #[tokio::test]
    async fn test_replicated_deployment_routes_reads_and_writes() {
        let factory = Arc::new(MockFactory::default());
        let app = Compuerta::new(replicated_config(), factory.clone())
            .await
            .unwrap();

        let rows = app.proxy().query("SELECT 1", &[]).await.unwrap();
        assert_eq!(source(&rows), Some(&Value::from("10.0.0.2")));

        app.proxy().exec("DELETE FROM t", &[]).await.unwrap();
        let primary = factory.connection("127.0.0.1").unwrap();
        assert_eq!(primary.statements(), vec!["DELETE FROM t"]);

        assert_eq!(app.replica_manager().replica_names().await, vec!["replica-1"]);
        assert!(app.shard_manager().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_primary_fails_startup() {
        let factory = Arc::new(MockFactory::default());
        factory.unreachable.lock().push("127.0.0.1".to_string());
        assert!(Compuerta::new(Config::default(), factory).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.pool.primary = None;
        let err = Compuerta::new(config, Arc::new(MockFactory::default()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CompuertaError::Config(_)));
    }

    #[tokio::test]
    async fn test_sharded_deployment() {
        let mut config = Config::default();
        config.pool.primary = None;
        config.shard = Some(ShardSettings {
            strategy: ShardingStrategy::Lookup,
            hash_function: HashFunction::Crc32,
            virtual_nodes: 150,
            enable_cross_shard: true,
            max_cross_shard_queries: 4,
            shards: (0..2)
                .map(|i| ShardEntry {
                    id: i,
                    name: format!("shard-{i}"),
                    weight: 1,
                    region: None,
                    database: DatabaseConfig::new(&format!("10.0.3.{i}"), 5432, "app", "app"),
                })
                .collect(),
            ranges: Vec::new(),
            lookups: vec![LookupEntry {
                key: "tenant-a".to_string(),
                shard_id: 1,
            }],
        });

        let app = Compuerta::new(config, Arc::new(MockFactory::default()))
            .await
            .unwrap();
        let shards = app.shard_manager().unwrap();
        assert_eq!(shards.shard_count().await, 2);
        assert_eq!(shards.get_shard("tenant-a").await.unwrap().id, 1);
        assert!(app.transaction_manager().is_err());
    }

    #[tokio::test]
    async fn test_transactions_run_on_primary() {
        let factory = Arc::new(MockFactory::default());
        let app = Compuerta::new(Config::default(), factory.clone())
            .await
            .unwrap();

        let txns = app.transaction_manager().unwrap();
        txns.execute_in_transaction(TransactionOptions::default(), |tx| {
            async move { tx.exec("INSERT INTO t VALUES (1)", &[]).await.map(|_| ()) }.boxed()
        })
        .await
        .unwrap();

        let primary = factory.connection("127.0.0.1").unwrap();
        assert_eq!(primary.state.commits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_closes_connections() {
        let factory = Arc::new(MockFactory::default());
        let app = Compuerta::new(replicated_config(), factory.clone())
            .await
            .unwrap();

        app.start().await;
        app.shutdown().await.unwrap();

        assert!(factory.connection("127.0.0.1").unwrap().is_closed());
        assert!(factory.connection("10.0.0.2").unwrap().is_closed());
    }
}
