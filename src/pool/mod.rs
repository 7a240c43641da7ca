/// Primary / replica / backup connection pooling with health-aware failover
///
/// The pool owns one primary, any number of replicas and backups. Callers only
/// read the `active` flags; the health-check loop is the single writer.
pub mod health;

use crate::config::DatabaseConfig;
use crate::core::{Connection, ConnectionFactory, ConnectionHandle, PoolStats};
use crate::error::{CompuertaError, CompuertaResult};
use crate::utils::BackgroundTask;
use health::{probe, HealthStatus, Transition};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Pool manager configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub health_check_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Role of a pool member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
    Backup,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
            Role::Backup => write!(f, "backup"),
        }
    }
}

/// One registered connection
pub struct PoolEntry {
    pub name: String,
    pub role: Role,
    pub priority: u32,
    pub weight: u32,
    connection: ConnectionHandle,
    active: AtomicBool,
}

impl PoolEntry {
    fn new(name: &str, role: Role, connection: ConnectionHandle, priority: u32, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            role,
            priority,
            weight,
            connection,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> ConnectionHandle {
        Arc::clone(&self.connection)
    }
}

/// Read-only view of a pool member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub name: String,
    pub role: Role,
    pub priority: u32,
    pub weight: u32,
    pub active: bool,
}

/// Pool manager for primary, replica and backup connections
pub struct PoolManager {
    config: PoolConfig,
    factory: Option<Arc<dyn ConnectionFactory>>,
    primary: RwLock<Option<Arc<PoolEntry>>>,
    replicas: RwLock<Vec<Arc<PoolEntry>>>,
    backups: RwLock<Vec<Arc<PoolEntry>>>,
    round_robin_counter: AtomicUsize,
    health_task: tokio::sync::Mutex<Option<BackgroundTask>>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            factory: None,
            primary: RwLock::new(None),
            replicas: RwLock::new(Vec::new()),
            backups: RwLock::new(Vec::new()),
            round_robin_counter: AtomicUsize::new(0),
            health_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Attach the factory used by the config-based registration methods
    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open a connection through the factory and verify it answers a ping
    async fn open(&self, name: &str, config: &DatabaseConfig) -> CompuertaResult<ConnectionHandle> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| CompuertaError::not_configured("connection factory"))?;
        let conn = factory.connect(config).await?;

        match probe(conn.as_ref(), self.config.ping_timeout).await {
            HealthStatus::Healthy => {
                tracing::debug!(member = name, endpoint = %config.endpoint(), "connection opened");
                Ok(conn)
            }
            HealthStatus::Timeout => {
                close_quietly(name, conn.as_ref()).await;
                Err(CompuertaError::timeout(format!("initial ping of {name}")))
            }
            HealthStatus::Unhealthy { reason } => {
                close_quietly(name, conn.as_ref()).await;
                Err(CompuertaError::connection(name, reason))
            }
        }
    }

    async fn ensure_unique(&self, name: &str, kind: &str) -> CompuertaResult<()> {
        let taken = self.replicas.read().await.iter().any(|e| e.name == name)
            || self.backups.read().await.iter().any(|e| e.name == name)
            || self
                .primary
                .read()
                .await
                .as_ref()
                .is_some_and(|p| p.name == name);
        if taken {
            return Err(CompuertaError::duplicate(kind, name));
        }
        Ok(())
    }

    /// Open, ping and store the primary. Replacing an existing primary is allowed.
    pub async fn set_primary(&self, name: &str, config: &DatabaseConfig) -> CompuertaResult<()> {
        let conn = self.open(name, config).await?;
        self.set_primary_connection(name, conn).await
    }

    pub async fn set_primary_connection(
        &self,
        name: &str,
        conn: ConnectionHandle,
    ) -> CompuertaResult<()> {
        let name_taken = self.replicas.read().await.iter().any(|e| e.name == name)
            || self.backups.read().await.iter().any(|e| e.name == name);
        if name_taken {
            return Err(CompuertaError::duplicate("primary", name));
        }

        let entry = Arc::new(PoolEntry::new(name, Role::Primary, conn, 0, 1));
        let previous = self.primary.write().await.replace(entry);
        if let Some(previous) = previous {
            tracing::warn!(old = %previous.name, new = name, "primary replaced");
        } else {
            tracing::info!(primary = name, "primary registered");
        }
        Ok(())
    }

    pub async fn add_replica(
        &self,
        name: &str,
        config: &DatabaseConfig,
        weight: u32,
    ) -> CompuertaResult<()> {
        self.ensure_unique(name, "replica").await?;
        let conn = self.open(name, config).await?;
        self.add_replica_connection(name, conn, weight).await
    }

    pub async fn add_replica_connection(
        &self,
        name: &str,
        conn: ConnectionHandle,
        weight: u32,
    ) -> CompuertaResult<()> {
        self.ensure_unique(name, "replica").await?;
        let entry = Arc::new(PoolEntry::new(name, Role::Replica, conn, 0, weight.max(1)));
        self.replicas.write().await.push(entry);
        tracing::info!(replica = name, weight = weight.max(1), "replica registered");
        Ok(())
    }

    pub async fn add_backup(
        &self,
        name: &str,
        config: &DatabaseConfig,
        priority: u32,
    ) -> CompuertaResult<()> {
        self.ensure_unique(name, "backup").await?;
        let conn = self.open(name, config).await?;
        self.add_backup_connection(name, conn, priority).await
    }

    pub async fn add_backup_connection(
        &self,
        name: &str,
        conn: ConnectionHandle,
        priority: u32,
    ) -> CompuertaResult<()> {
        self.ensure_unique(name, "backup").await?;
        let entry = Arc::new(PoolEntry::new(name, Role::Backup, conn, priority, 1));
        self.backups.write().await.push(entry);
        tracing::info!(backup = name, priority, "backup registered");
        Ok(())
    }

    /// Get the primary connection
    pub async fn get_primary(&self) -> CompuertaResult<ConnectionHandle> {
        let primary = self.primary.read().await;
        let entry = primary
            .as_ref()
            .ok_or_else(|| CompuertaError::not_configured("primary"))?;
        if !entry.is_active() {
            return Err(CompuertaError::not_active("primary", &entry.name));
        }
        Ok(entry.connection())
    }

    /// Round robin over active replicas, falling back to the primary
    pub async fn get_replica(&self) -> CompuertaResult<ConnectionHandle> {
        let active: Vec<Arc<PoolEntry>> = self
            .replicas
            .read()
            .await
            .iter()
            .filter(|e| e.is_active())
            .cloned()
            .collect();

        if active.is_empty() {
            tracing::warn!("no active replica, falling back to primary");
            return self.get_primary().await;
        }

        let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % active.len();
        Ok(active[index].connection())
    }

    pub async fn get_for_read(&self) -> CompuertaResult<ConnectionHandle> {
        self.get_replica().await
    }

    pub async fn get_for_write(&self) -> CompuertaResult<ConnectionHandle> {
        self.get_primary().await
    }

    /// Look up any member by name, regardless of its health
    pub async fn get_by_name(&self, name: &str) -> CompuertaResult<ConnectionHandle> {
        self.entry_by_name(name)
            .await
            .map(|e| e.connection())
            .ok_or_else(|| CompuertaError::not_configured(format!("pool member {name}")))
    }

    /// The active backup with the lowest priority value
    pub async fn get_backup(&self) -> CompuertaResult<ConnectionHandle> {
        let backups = self.backups.read().await;
        if backups.is_empty() {
            return Err(CompuertaError::not_configured("backup"));
        }
        backups
            .iter()
            .filter(|e| e.is_active())
            .min_by_key(|e| e.priority)
            .map(|e| e.connection())
            .ok_or_else(|| CompuertaError::not_active("backup", "all"))
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.entry_by_name(name)
            .await
            .is_some_and(|e| e.is_active())
    }

    async fn entry_by_name(&self, name: &str) -> Option<Arc<PoolEntry>> {
        if let Some(primary) = self.primary.read().await.as_ref() {
            if primary.name == name {
                return Some(Arc::clone(primary));
            }
        }
        if let Some(entry) = self.replicas.read().await.iter().find(|e| e.name == name) {
            return Some(Arc::clone(entry));
        }
        self.backups
            .read()
            .await
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    async fn all_entries(&self) -> Vec<Arc<PoolEntry>> {
        let mut entries = Vec::new();
        if let Some(primary) = self.primary.read().await.as_ref() {
            entries.push(Arc::clone(primary));
        }
        entries.extend(self.replicas.read().await.iter().cloned());
        entries.extend(self.backups.read().await.iter().cloned());
        entries
    }

    /// Driver statistics per member
    pub async fn get_stats(&self) -> HashMap<String, PoolStats> {
        self.all_entries()
            .await
            .into_iter()
            .map(|e| (e.name.clone(), e.connection.stats()))
            .collect()
    }

    /// Role, weight and health of every member
    pub async fn get_pool_info(&self) -> Vec<PoolInfo> {
        self.all_entries()
            .await
            .into_iter()
            .map(|e| PoolInfo {
                name: e.name.clone(),
                role: e.role,
                priority: e.priority,
                weight: e.weight,
                active: e.is_active(),
            })
            .collect()
    }

    /// Ping every member concurrently and flip `active` on transitions
    pub async fn check_health(&self) {
        let entries = self.all_entries().await;
        let ping_timeout = self.config.ping_timeout;

        let probes = entries.iter().map(|entry| async move {
            let status = probe(entry.connection.as_ref(), ping_timeout).await;
            (entry, status)
        });

        for (entry, status) in futures::future::join_all(probes).await {
            let healthy = status.is_healthy();
            let was_active = entry.active.swap(healthy, Ordering::AcqRel);
            match Transition::between(was_active, healthy) {
                Transition::Recovered => {
                    tracing::info!(member = %entry.name, role = %entry.role, "connection recovered");
                }
                Transition::Failed => {
                    tracing::warn!(member = %entry.name, role = %entry.role, status = %status, "connection marked inactive");
                }
                Transition::Unchanged => {
                    tracing::trace!(member = %entry.name, status = %status, "health check");
                }
            }
        }
    }

    /// Start the periodic health check. A second call while running is a no-op.
    pub async fn start_health_check(self: &Arc<Self>) {
        let mut task = self.health_task.lock().await;
        if task.as_ref().is_some_and(|t| t.is_running()) {
            return;
        }

        let pool = Arc::clone(self);
        *task = Some(BackgroundTask::spawn_periodic(
            "pool-health-check",
            self.config.health_check_interval,
            move || {
                let pool = Arc::clone(&pool);
                async move { pool.check_health().await }
            },
        ));
        tracing::info!(
            interval = %crate::utils::format_duration(self.config.health_check_interval),
            "pool health check started"
        );
    }

    pub async fn stop_health_check(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.stop().await;
            tracing::info!("pool health check stopped");
        }
    }

    /// Stop health checks and close every connection, reporting all close failures
    pub async fn close_all(&self) -> CompuertaResult<()> {
        self.stop_health_check().await;

        let mut failures = Vec::new();
        for entry in self.all_entries().await {
            if let Err(e) = entry.connection.close().await {
                tracing::warn!(member = %entry.name, error = %e, "failed to close connection");
                failures.push(format!("{}: {}", entry.name, e));
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

async fn close_quietly(name: &str, conn: &dyn Connection) {
    if let Err(e) = conn.close().await {
        tracing::warn!(member = name, error = %e, "failed to close rejected connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{MockConnection, MockFactory};
    use crate::core::Connection;

    async fn pool_with(replicas: &[&str]) -> (Arc<PoolManager>, Vec<Arc<MockConnection>>) {
        let pool = Arc::new(PoolManager::new(PoolConfig::default()));
        let primary = MockConnection::arc("primary");
        pool.set_primary_connection("primary", primary.clone()).await.unwrap();

        let mut conns = vec![primary];
        for name in replicas {
            let conn = MockConnection::arc(name);
            pool.add_replica_connection(name, conn.clone(), 1).await.unwrap();
            conns.push(conn);
        }
        (pool, conns)
    }

    async fn source_of(conn: ConnectionHandle) -> String {
        let rows = conn.query("SELECT 1", &[]).await.unwrap();
        match rows.get(0, "source") {
            Some(crate::core::Value::Text(s)) => s.clone(),
            other => panic!("unexpected row {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_primary_not_configured() {
        let pool = PoolManager::new(PoolConfig::default());
        let err = pool.get_primary().await.err().unwrap();
        assert!(matches!(err, CompuertaError::NotConfigured { .. }));
        assert!(pool.get_replica().await.is_err());
    }

    #[tokio::test]
    async fn test_round_robin_over_replicas() {
        let (pool, _) = pool_with(&["r1", "r2"]).await;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(source_of(pool.get_replica().await.unwrap()).await);
        }
        assert_eq!(seen, vec!["r1", "r2", "r1", "r2"]);
        assert_eq!(source_of(pool.get_for_write().await.unwrap()).await, "primary");
    }

    #[tokio::test]
    async fn test_replica_falls_back_to_primary() {
        let (pool, conns) = pool_with(&["r1"]).await;
        conns[1].set_ping_failing(true);
        pool.check_health().await;

        assert!(!pool.is_active("r1").await);
        assert_eq!(source_of(pool.get_for_read().await.unwrap()).await, "primary");
    }

    #[tokio::test]
    async fn test_health_check_flips_active_flag_both_ways() {
        let (pool, conns) = pool_with(&["r1"]).await;

        conns[0].set_ping_failing(true);
        pool.check_health().await;
        let err = pool.get_primary().await.err().unwrap();
        assert!(matches!(err, CompuertaError::NotActive { .. }));

        conns[0].set_ping_failing(false);
        pool.check_health().await;
        assert!(pool.get_primary().await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let (pool, _) = pool_with(&["r1"]).await;
        let err = pool
            .add_replica_connection("r1", MockConnection::arc("r1"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CompuertaError::DuplicateName { .. }));

        let err = pool
            .add_backup_connection("primary", MockConnection::arc("b"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CompuertaError::DuplicateName { .. }));
    }

    #[tokio::test]
    async fn test_get_by_name_and_backup_priority() {
        let (pool, _) = pool_with(&["r1"]).await;
        pool.add_backup_connection("b-low", MockConnection::arc("b-low"), 5)
            .await
            .unwrap();
        pool.add_backup_connection("b-high", MockConnection::arc("b-high"), 1)
            .await
            .unwrap();

        assert_eq!(source_of(pool.get_by_name("r1").await.unwrap()).await, "r1");
        assert!(pool.get_by_name("nope").await.is_err());
        assert_eq!(source_of(pool.get_backup().await.unwrap()).await, "b-high");

        let info = pool.get_pool_info().await;
        assert_eq!(info.len(), 4);
        assert_eq!(info[0].role, Role::Primary);
        assert_eq!(pool.get_stats().await.len(), 4);
    }

    #[tokio::test]
    async fn test_set_primary_through_factory() {
        let factory = Arc::new(MockFactory::default());
        let pool = PoolManager::new(PoolConfig::default()).with_factory(factory.clone());

        pool.set_primary("primary", &DatabaseConfig::new("db-1", 5432, "app", "app"))
            .await
            .unwrap();
        assert!(pool.get_primary().await.is_ok());

        // last write wins
        pool.set_primary("primary", &DatabaseConfig::new("db-2", 5432, "app", "app"))
            .await
            .unwrap();
        assert_eq!(source_of(pool.get_primary().await.unwrap()).await, "db-2");

        factory.unreachable.lock().push("db-3".to_string());
        let err = pool
            .add_replica("r1", &DatabaseConfig::new("db-3", 5432, "app", "app"), 1)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_set_primary_rejects_failed_ping() {
        let factory = Arc::new(MockFactory::default());
        let conn = MockConnection::arc("db-1");
        conn.set_ping_failing(true);
        factory.connections.lock().insert("db-1".to_string(), conn.clone());

        let pool = PoolManager::new(PoolConfig::default()).with_factory(factory);
        let result = pool
            .set_primary("primary", &DatabaseConfig::new("db-1", 5432, "app", "app"))
            .await;
        assert!(result.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_connection_close_failure_keeps_ping_error() {
        let factory = Arc::new(MockFactory::default());
        let conn = MockConnection::arc("db-1");
        conn.set_ping_failing(true);
        conn.set_close_failing(true);
        factory.connections.lock().insert("db-1".to_string(), conn.clone());

        let pool = PoolManager::new(PoolConfig::default()).with_factory(factory);
        let err = pool
            .add_replica("r1", &DatabaseConfig::new("db-1", 5432, "app", "app"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CompuertaError::Connection { .. }));
        assert!(!err.to_string().contains("close failed"));
        assert!(conn.is_closed());
        assert!(pool.get_by_name("r1").await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_aggregates_errors() {
        let (pool, conns) = pool_with(&["r1", "r2"]).await;
        conns[1].set_close_failing(true);
        conns[2].set_close_failing(true);

        let err = pool.close_all().await.unwrap_err();
        match err {
            CompuertaError::CloseFailed { count, .. } => assert_eq!(count, 2),
            other => panic!("unexpected error {other}"),
        }
        assert!(conns.iter().all(|c| c.is_closed()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_loop_start_is_idempotent() {
        let (pool, conns) = pool_with(&["r1"]).await;
        pool.start_health_check().await;
        pool.start_health_check().await;

        conns[1].set_ping_failing(true);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!pool.is_active("r1").await);

        pool.stop_health_check().await;
        conns[1].set_ping_failing(false);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!pool.is_active("r1").await);
    }

    #[tokio::test]
    async fn test_connection_trait_object_is_shared() {
        let (pool, conns) = pool_with(&[]).await;
        let handle = pool.get_primary().await.unwrap();
        handle.exec("UPDATE t SET x = 1", &[]).await.unwrap();
        assert_eq!(conns[0].statements(), vec!["UPDATE t SET x = 1"]);
    }
}
