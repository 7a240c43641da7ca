/// Replica selection and health accounting
///
/// The replica manager works on replica names only. Failure accounting happens
/// inline on every call (`record_success` / `record_failure`); replication lag and
/// recovery are refreshed by two background loops.
pub mod balancer;
pub mod lag;

pub use balancer::{Candidate, LoadBalanceStrategy, LoadBalancingAlgorithm};
pub use lag::{Dialect, PoolResolver, ReplicaResolver};

use crate::error::{CompuertaError, CompuertaResult};
use crate::pool::health::{probe, HealthStatus};
use crate::utils::BackgroundTask;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Replica manager configuration
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub strategy: LoadBalanceStrategy,
    /// Replicas lagging more than this are skipped by selection
    pub max_replica_lag: Duration,
    /// Consecutive failures that deactivate a replica
    pub failover_threshold: u32,
    pub lag_check_interval: Duration,
    pub recovery_check_interval: Duration,
    pub auto_recovery: bool,
    /// Bound on each lag query and recovery ping
    pub probe_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalanceStrategy::WeightedRoundRobin,
            max_replica_lag: Duration::from_secs(10),
            failover_threshold: 3,
            lag_check_interval: Duration::from_secs(10),
            recovery_check_interval: Duration::from_secs(30),
            auto_recovery: true,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Last replication lag measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LagSnapshot {
    pub lag: Duration,
    pub checked_at: SystemTime,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Health record for one replica
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaHealth {
    pub name: String,
    pub active: bool,
    pub weight: u32,
    pub effective_weight: u32,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success: Option<SystemTime>,
    pub last_error: Option<String>,
    pub last_response_time: Option<Duration>,
    pub lag: Option<LagSnapshot>,
}

impl ReplicaHealth {
    fn new(name: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            active: true,
            weight,
            effective_weight: weight,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            last_success: None,
            last_error: None,
            last_response_time: None,
            lag: None,
        }
    }

    fn within_lag(&self, max: Duration) -> bool {
        self.lag.as_ref().map_or(true, |snapshot| snapshot.lag <= max)
    }
}

#[derive(Default)]
struct ReplicaState {
    /// Registration order
    order: Vec<String>,
    replicas: HashMap<String, ReplicaHealth>,
    /// Each name repeated by its effective weight
    weighted_pool: Vec<String>,
}

impl ReplicaState {
    fn rebuild_pool(&mut self) {
        let replicas = &self.replicas;
        self.weighted_pool = self
            .order
            .iter()
            .filter_map(|name| replicas.get(name))
            .flat_map(|r| std::iter::repeat(r.name.clone()).take(r.effective_weight as usize))
            .collect();
    }

    fn get_mut(&mut self, name: &str) -> CompuertaResult<&mut ReplicaHealth> {
        self.replicas
            .get_mut(name)
            .ok_or_else(|| CompuertaError::not_configured(format!("replica {name}")))
    }
}

struct Monitors {
    lag: BackgroundTask,
    recovery: Option<BackgroundTask>,
}

/// Pluggable replica selection engine
pub struct ReplicaManager {
    config: ReplicaConfig,
    state: RwLock<ReplicaState>,
    algorithm: Box<dyn LoadBalancingAlgorithm>,
    monitors: Mutex<Option<Monitors>>,
}

impl fmt::Debug for ReplicaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReplicaManager {
    pub fn new(config: ReplicaConfig) -> Self {
        let algorithm = balancer::algorithm_for(config.strategy);
        Self {
            config,
            state: RwLock::new(ReplicaState::default()),
            algorithm,
            monitors: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Register a replica. Non-positive weights are clamped to 1.
    pub async fn register_replica(&self, name: &str, weight: i32) -> CompuertaResult<()> {
        let weight = weight.max(1) as u32;
        let mut state = self.state.write().await;
        if state.replicas.contains_key(name) {
            return Err(CompuertaError::duplicate("replica", name));
        }

        state.order.push(name.to_string());
        state
            .replicas
            .insert(name.to_string(), ReplicaHealth::new(name, weight));
        state.rebuild_pool();

        info!(replica = %name, weight, "Registered replica");
        Ok(())
    }

    pub async fn unregister_replica(&self, name: &str) -> CompuertaResult<()> {
        let mut state = self.state.write().await;
        if state.replicas.remove(name).is_none() {
            return Err(CompuertaError::not_configured(format!("replica {name}")));
        }
        state.order.retain(|n| n != name);
        state.rebuild_pool();

        info!(replica = %name, "Unregistered replica");
        Ok(())
    }

    /// Pick a replica among active ones within the lag threshold
    pub async fn select_replica(&self) -> CompuertaResult<String> {
        let state = self.state.read().await;
        if state.order.is_empty() {
            return Err(CompuertaError::NoHealthyReplica {
                reason: "no replicas registered".to_string(),
            });
        }

        let max_lag = self.config.max_replica_lag;
        let candidates: Vec<Candidate> = state
            .order
            .iter()
            .filter_map(|name| state.replicas.get(name))
            .filter(|r| r.active && r.within_lag(max_lag))
            .map(|r| Candidate {
                name: r.name.clone(),
                lag: r.lag.as_ref().map(|s| s.lag),
            })
            .collect();

        if candidates.is_empty() {
            return Err(CompuertaError::NoHealthyReplica {
                reason: format!(
                    "all {} replicas are inactive or lagging beyond {:?}",
                    state.order.len(),
                    max_lag
                ),
            });
        }

        let pool: Vec<&str> = state
            .weighted_pool
            .iter()
            .map(String::as_str)
            .filter(|name| candidates.iter().any(|c| c.name == *name))
            .collect();

        self.algorithm
            .select_replica(&candidates, &pool)
            .ok_or_else(|| CompuertaError::NoHealthyReplica {
                reason: "selection returned no replica".to_string(),
            })
    }

    /// Record a successful call. Does not reactivate an inactive replica.
    pub async fn record_success(&self, name: &str, response_time: Duration) -> CompuertaResult<()> {
        let mut state = self.state.write().await;
        let replica = state.get_mut(name)?;

        replica.consecutive_failures = 0;
        replica.last_error = None;
        replica.last_success = Some(SystemTime::now());
        replica.last_response_time = Some(response_time);
        replica.total_successes += 1;

        let grew = replica.active && replica.effective_weight < replica.weight;
        if grew {
            replica.effective_weight += 1;
            state.rebuild_pool();
        }
        Ok(())
    }

    /// Record a failed call, deactivating the replica at the failover threshold
    pub async fn record_failure(&self, name: &str, error: &str) -> CompuertaResult<()> {
        let threshold = self.config.failover_threshold;
        let mut state = self.state.write().await;
        let replica = state.get_mut(name)?;

        replica.total_failures += 1;
        replica.consecutive_failures += 1;
        replica.last_error = Some(error.to_string());
        replica.effective_weight = replica.effective_weight.saturating_sub(1);

        if replica.active && replica.consecutive_failures >= threshold {
            replica.active = false;
            replica.effective_weight = 0;
            warn!(
                replica = %name,
                failures = replica.consecutive_failures,
                error = %error,
                "Replica deactivated after consecutive failures"
            );
        } else {
            debug!(replica = %name, error = %error, "Replica failure recorded");
        }

        state.rebuild_pool();
        Ok(())
    }

    /// Overwrite the lag snapshot of a replica
    pub async fn update_replica_lag(
        &self,
        name: &str,
        lag: Duration,
        error: Option<String>,
    ) -> CompuertaResult<()> {
        let max_lag = self.config.max_replica_lag;
        let mut state = self.state.write().await;
        let replica = state.get_mut(name)?;

        let healthy = error.is_none() && lag <= max_lag;
        let was_healthy = replica.lag.as_ref().map_or(true, |s| s.healthy);
        if was_healthy && !healthy {
            warn!(replica = %name, lag = ?lag, error = ?error, "Replica lag unhealthy");
        } else if !was_healthy && healthy {
            info!(replica = %name, lag = ?lag, "Replica lag back within threshold");
        }

        replica.lag = Some(LagSnapshot {
            lag,
            checked_at: SystemTime::now(),
            healthy,
            error,
        });
        Ok(())
    }

    /// Put a replica back in rotation with its full weight
    pub async fn reactivate(&self, name: &str) -> CompuertaResult<()> {
        let mut state = self.state.write().await;
        let replica = state.get_mut(name)?;
        replica.active = true;
        replica.consecutive_failures = 0;
        replica.last_error = None;
        replica.effective_weight = replica.weight;
        state.rebuild_pool();

        info!(replica = %name, "Replica recovered");
        Ok(())
    }

    pub async fn get_replica(&self, name: &str) -> Option<ReplicaHealth> {
        self.state.read().await.replicas.get(name).cloned()
    }

    /// Snapshot of every replica, in registration order
    pub async fn get_replica_status(&self) -> Vec<ReplicaHealth> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|name| state.replicas.get(name).cloned())
            .collect()
    }

    /// Active replicas within the lag threshold
    pub async fn healthy_replica_count(&self) -> usize {
        let max_lag = self.config.max_replica_lag;
        self.state
            .read()
            .await
            .replicas
            .values()
            .filter(|r| r.active && r.within_lag(max_lag))
            .count()
    }

    pub async fn replica_names(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    /// Query replication lag on every registered replica
    pub async fn check_lag(&self, resolver: &dyn ReplicaResolver) {
        for name in self.replica_names().await {
            let result = match resolver.resolve(&name).await {
                Ok((conn, dialect)) => {
                    lag::measure_lag(conn.as_ref(), dialect, self.config.probe_timeout).await
                }
                Err(e) => Err(e),
            };

            let update = match result {
                Ok(Some(lag)) => {
                    debug!(replica = %name, lag = ?lag, "Replication lag measured");
                    self.update_replica_lag(&name, lag, None).await
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(replica = %name, error = %e, "Replication lag check failed");
                    let previous = self
                        .get_replica(&name)
                        .await
                        .and_then(|r| r.lag.map(|s| s.lag))
                        .unwrap_or_default();
                    self.update_replica_lag(&name, previous, Some(e.to_string()))
                        .await
                }
            };

            // The replica may have been unregistered mid-tick
            if let Err(e) = update {
                debug!(replica = %name, error = %e, "Skipping lag update");
            }
        }
    }

    /// Ping inactive replicas, and active ones drained to zero effective
    /// weight, and restore those that answer
    pub async fn recover_inactive(&self, resolver: &dyn ReplicaResolver) {
        let inactive: Vec<String> = self
            .get_replica_status()
            .await
            .into_iter()
            .filter(|r| !r.active || r.effective_weight == 0)
            .map(|r| r.name)
            .collect();

        for name in inactive {
            let status = match resolver.resolve(&name).await {
                Ok((conn, _)) => probe(conn.as_ref(), self.config.probe_timeout).await,
                Err(e) => HealthStatus::Unhealthy {
                    reason: e.to_string(),
                },
            };

            if status.is_healthy() {
                if let Err(e) = self.reactivate(&name).await {
                    debug!(replica = %name, error = %e, "Skipping recovery");
                }
            } else {
                debug!(replica = %name, status = %status, "Replica still unavailable");
            }
        }
    }

    /// Start the lag monitor and, with auto-recovery, the recovery probe
    pub async fn start_monitoring(self: &Arc<Self>, resolver: Arc<dyn ReplicaResolver>) {
        let mut monitors = self.monitors.lock().await;
        if monitors.as_ref().is_some_and(|m| m.lag.is_running()) {
            debug!("Replica monitoring already running");
            return;
        }

        let manager = Arc::clone(self);
        let lag_resolver = Arc::clone(&resolver);
        let lag = BackgroundTask::spawn_periodic(
            "replica-lag",
            self.config.lag_check_interval,
            move || {
                let manager = Arc::clone(&manager);
                let resolver = Arc::clone(&lag_resolver);
                async move { manager.check_lag(resolver.as_ref()).await }
            },
        );

        let recovery = self.config.auto_recovery.then(|| {
            let manager = Arc::clone(self);
            BackgroundTask::spawn_periodic(
                "replica-recovery",
                self.config.recovery_check_interval,
                move || {
                    let manager = Arc::clone(&manager);
                    let resolver = Arc::clone(&resolver);
                    async move { manager.recover_inactive(resolver.as_ref()).await }
                },
            )
        });

        info!(
            lag_interval = ?self.config.lag_check_interval,
            auto_recovery = self.config.auto_recovery,
            "Started replica monitoring"
        );
        *monitors = Some(Monitors { lag, recovery });
    }

    pub async fn stop_monitoring(&self) {
        let monitors = self.monitors.lock().await.take();
        if let Some(monitors) = monitors {
            monitors.lag.stop().await;
            if let Some(recovery) = monitors.recovery {
                recovery.stop().await;
            }
            info!("Stopped replica monitoring");
        }
    }

    /// Names currently eligible for weighted selection, with repetition
    pub async fn weighted_pool(&self) -> Vec<String> {
        self.state.read().await.weighted_pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::MockConnection;
    use crate::core::{ConnectionHandle, Rows, Value};
    use async_trait::async_trait;

    fn manager(strategy: LoadBalanceStrategy) -> ReplicaManager {
        ReplicaManager::new(ReplicaConfig {
            strategy,
            ..ReplicaConfig::default()
        })
    }

    struct MockResolver {
        replicas: HashMap<String, Arc<MockConnection>>,
    }

    impl MockResolver {
        fn new(names: &[&str]) -> Self {
            Self {
                replicas: names
                    .iter()
                    .map(|n| (n.to_string(), MockConnection::arc(n)))
                    .collect(),
            }
        }

        fn set_lag(&self, name: &str, seconds: i64) {
            let sql = Dialect::Postgres.lag_query().unwrap();
            self.replicas[name].respond(
                sql,
                Rows::new(
                    vec!["lag_seconds".to_string()],
                    vec![vec![Value::Int(seconds)]],
                ),
            );
        }
    }

    #[async_trait]
    impl ReplicaResolver for MockResolver {
        async fn resolve(&self, name: &str) -> CompuertaResult<(ConnectionHandle, Dialect)> {
            let conn = self
                .replicas
                .get(name)
                .cloned()
                .ok_or_else(|| CompuertaError::not_configured(name))?;
            Ok((conn, Dialect::Postgres))
        }
    }

    #[tokio::test]
    async fn test_register_clamps_weight_and_rejects_duplicates() {
        let rm = manager(LoadBalanceStrategy::WeightedRoundRobin);
        rm.register_replica("r1", 0).await.unwrap();
        rm.register_replica("r2", -5).await.unwrap();
        rm.register_replica("r3", 3).await.unwrap();

        assert_eq!(rm.get_replica("r1").await.unwrap().weight, 1);
        assert_eq!(rm.get_replica("r2").await.unwrap().weight, 1);
        assert_eq!(rm.weighted_pool().await.len(), 5);

        let err = rm.register_replica("r3", 1).await.unwrap_err();
        assert!(matches!(err, CompuertaError::DuplicateName { .. }));
    }

    #[tokio::test]
    async fn test_weighted_fairness() {
        let rm = manager(LoadBalanceStrategy::WeightedRoundRobin);
        rm.register_replica("heavy", 3).await.unwrap();
        rm.register_replica("light", 1).await.unwrap();

        let mut heavy = 0u32;
        let mut light = 0u32;
        for _ in 0..8000 {
            match rm.select_replica().await.unwrap().as_str() {
                "heavy" => heavy += 1,
                _ => light += 1,
            }
        }

        let ratio = heavy as f64 / light as f64;
        assert!((2.5..=3.5).contains(&ratio), "ratio was {ratio}");
    }

    #[tokio::test]
    async fn test_round_robin_cycles_active_replicas() {
        let rm = manager(LoadBalanceStrategy::RoundRobin);
        for name in ["a", "b", "c"] {
            rm.register_replica(name, 1).await.unwrap();
        }

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(rm.select_replica().await.unwrap());
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failover_threshold() {
        let rm = manager(LoadBalanceStrategy::RoundRobin);
        rm.register_replica("r1", 2).await.unwrap();
        rm.register_replica("r2", 1).await.unwrap();

        for _ in 0..3 {
            rm.record_failure("r1", "connection reset").await.unwrap();
        }
        let r1 = rm.get_replica("r1").await.unwrap();
        assert!(!r1.active);
        assert_eq!(r1.effective_weight, 0);
        assert_eq!(r1.total_failures, 3);

        rm.record_success("r1", Duration::from_millis(5)).await.unwrap();
        let r1 = rm.get_replica("r1").await.unwrap();
        assert!(!r1.active);
        assert_eq!(r1.consecutive_failures, 0);

        for _ in 0..5 {
            assert_eq!(rm.select_replica().await.unwrap(), "r2");
        }
    }

    #[tokio::test]
    async fn test_effective_weight_decay_and_recovery() {
        let rm = manager(LoadBalanceStrategy::WeightedRoundRobin);
        rm.register_replica("r1", 3).await.unwrap();

        rm.record_failure("r1", "timeout").await.unwrap();
        rm.record_failure("r1", "timeout").await.unwrap();
        let r1 = rm.get_replica("r1").await.unwrap();
        assert!(r1.active);
        assert_eq!(r1.effective_weight, 1);
        assert_eq!(r1.last_error.as_deref(), Some("timeout"));
        assert_eq!(rm.weighted_pool().await.len(), 1);

        for _ in 0..5 {
            rm.record_success("r1", Duration::from_millis(2)).await.unwrap();
        }
        let r1 = rm.get_replica("r1").await.unwrap();
        assert_eq!(r1.effective_weight, 3);
        assert!(r1.last_error.is_none());
        assert_eq!(r1.last_response_time, Some(Duration::from_millis(2)));
    }

    #[tokio::test]
    async fn test_drained_replica_leaves_weighted_selection() {
        let rm = manager(LoadBalanceStrategy::WeightedRoundRobin);
        rm.register_replica("r1", 1).await.unwrap();
        rm.register_replica("r2", 2).await.unwrap();

        rm.record_failure("r1", "timeout").await.unwrap();
        let r1 = rm.get_replica("r1").await.unwrap();
        assert!(r1.active);
        assert_eq!(r1.effective_weight, 0);
        for _ in 0..6 {
            assert_eq!(rm.select_replica().await.unwrap(), "r2");
        }

        rm.record_failure("r2", "timeout").await.unwrap();
        rm.record_failure("r2", "timeout").await.unwrap();
        assert!(matches!(
            rm.select_replica().await,
            Err(CompuertaError::NoHealthyReplica { .. })
        ));

        let resolver = MockResolver::new(&["r1", "r2"]);
        rm.recover_inactive(&resolver).await;
        assert_eq!(rm.get_replica("r1").await.unwrap().effective_weight, 1);
        assert_eq!(rm.get_replica("r2").await.unwrap().effective_weight, 2);
        assert_eq!(rm.weighted_pool().await.len(), 3);
    }

    #[tokio::test]
    async fn test_lag_filtering() {
        let rm = manager(LoadBalanceStrategy::RoundRobin);
        rm.register_replica("lagging", 1).await.unwrap();
        rm.register_replica("fresh", 1).await.unwrap();

        rm.update_replica_lag("lagging", Duration::from_secs(15), None)
            .await
            .unwrap();
        rm.update_replica_lag("fresh", Duration::from_secs(10), None)
            .await
            .unwrap();

        let lagging = rm.get_replica("lagging").await.unwrap();
        assert!(lagging.active);
        assert!(!lagging.lag.unwrap().healthy);

        for _ in 0..4 {
            assert_eq!(rm.select_replica().await.unwrap(), "fresh");
        }
        assert_eq!(rm.healthy_replica_count().await, 1);
    }

    #[tokio::test]
    async fn test_least_lag_strategy() {
        let rm = manager(LoadBalanceStrategy::LeastLag);
        rm.register_replica("a", 1).await.unwrap();
        rm.register_replica("b", 1).await.unwrap();
        rm.update_replica_lag("a", Duration::from_secs(4), None).await.unwrap();
        rm.update_replica_lag("b", Duration::from_secs(1), None).await.unwrap();

        assert_eq!(rm.select_replica().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_select_errors_when_nothing_eligible() {
        let rm = manager(LoadBalanceStrategy::Random);
        assert!(matches!(
            rm.select_replica().await,
            Err(CompuertaError::NoHealthyReplica { .. })
        ));

        rm.register_replica("only", 1).await.unwrap();
        for _ in 0..3 {
            rm.record_failure("only", "down").await.unwrap();
        }
        assert!(matches!(
            rm.select_replica().await,
            Err(CompuertaError::NoHealthyReplica { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_replica_is_an_error() {
        let rm = manager(LoadBalanceStrategy::RoundRobin);
        assert!(rm.record_success("ghost", Duration::ZERO).await.is_err());
        assert!(rm.record_failure("ghost", "x").await.is_err());
        assert!(rm.unregister_replica("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_removes_from_rotation() {
        let rm = manager(LoadBalanceStrategy::WeightedRoundRobin);
        rm.register_replica("a", 2).await.unwrap();
        rm.register_replica("b", 1).await.unwrap();
        rm.unregister_replica("a").await.unwrap();

        assert_eq!(rm.weighted_pool().await, vec!["b".to_string()]);
        assert_eq!(rm.get_replica_status().await.len(), 1);
        assert_eq!(rm.select_replica().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_check_lag_updates_snapshots() {
        let rm = manager(LoadBalanceStrategy::RoundRobin);
        rm.register_replica("r1", 1).await.unwrap();
        rm.register_replica("r2", 1).await.unwrap();
        rm.register_replica("missing", 1).await.unwrap();

        let resolver = MockResolver::new(&["r1", "r2"]);
        resolver.set_lag("r1", 2);
        resolver.set_lag("r2", 30);

        rm.check_lag(&resolver).await;

        let r1 = rm.get_replica("r1").await.unwrap().lag.unwrap();
        assert_eq!(r1.lag, Duration::from_secs(2));
        assert!(r1.healthy);

        let r2 = rm.get_replica("r2").await.unwrap().lag.unwrap();
        assert!(!r2.healthy);

        let missing = rm.get_replica("missing").await.unwrap().lag.unwrap();
        assert!(!missing.healthy);
        assert!(missing.error.is_some());
        // An errored probe does not by itself exclude the replica
        assert_eq!(rm.healthy_replica_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_loop_reactivates_replica() {
        let rm = Arc::new(ReplicaManager::new(ReplicaConfig {
            strategy: LoadBalanceStrategy::RoundRobin,
            recovery_check_interval: Duration::from_secs(30),
            ..ReplicaConfig::default()
        }));
        rm.register_replica("r1", 2).await.unwrap();
        for _ in 0..3 {
            rm.record_failure("r1", "down").await.unwrap();
        }

        let resolver = Arc::new(MockResolver::new(&["r1"]));
        resolver.replicas["r1"].set_ping_failing(true);
        rm.start_monitoring(resolver.clone()).await;
        // Second start is a no-op
        rm.start_monitoring(resolver.clone()).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!rm.get_replica("r1").await.unwrap().active);

        resolver.replicas["r1"].set_ping_failing(false);
        tokio::time::sleep(Duration::from_secs(31)).await;

        let r1 = rm.get_replica("r1").await.unwrap();
        assert!(r1.active);
        assert_eq!(r1.effective_weight, 2);
        assert_eq!(r1.consecutive_failures, 0);

        rm.stop_monitoring().await;
    }
}
