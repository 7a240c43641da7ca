/// Replication lag probing
use crate::core::{Connection, ConnectionHandle, Rows};
use crate::error::{CompuertaError, CompuertaResult};
use crate::pool::PoolManager;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Database kind, used to pick the lag query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    Sqlite,
}

impl Dialect {
    /// SQL that reports replication lag, or `None` if the dialect has no replication
    pub fn lag_query(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some(
                "SELECT COALESCE(EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())), 0) AS lag_seconds",
            ),
            Dialect::MySql => Some("SHOW REPLICA STATUS"),
            Dialect::Sqlite => None,
        }
    }

    /// Extract the lag from the result of `lag_query`
    pub fn parse_lag(&self, rows: &Rows) -> CompuertaResult<Duration> {
        let value = match self {
            Dialect::Postgres => rows.get(0, "lag_seconds"),
            Dialect::MySql => {
                if rows.is_empty() {
                    return Err(CompuertaError::query("replication is not configured"));
                }
                rows.get(0, "Seconds_Behind_Source")
                    .or_else(|| rows.get(0, "Seconds_Behind_Master"))
            }
            Dialect::Sqlite => return Ok(Duration::ZERO),
        };

        // NULL on a replica whose IO thread is stopped; treat as unknown
        let seconds = value
            .and_then(|v| v.as_f64())
            .ok_or_else(|| CompuertaError::query("lag value missing from result"))?;

        Ok(Duration::from_secs_f64(seconds.max(0.0)))
    }
}

/// Maps a replica name to its connection and dialect
#[async_trait]
pub trait ReplicaResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> CompuertaResult<(ConnectionHandle, Dialect)>;
}

/// Resolver backed by the pool's named entries
pub struct PoolResolver {
    pool: Arc<PoolManager>,
    dialects: HashMap<String, Dialect>,
}

impl PoolResolver {
    pub fn new(pool: Arc<PoolManager>, dialects: HashMap<String, Dialect>) -> Self {
        Self { pool, dialects }
    }
}

#[async_trait]
impl ReplicaResolver for PoolResolver {
    async fn resolve(&self, name: &str) -> CompuertaResult<(ConnectionHandle, Dialect)> {
        let conn = self.pool.get_by_name(name).await?;
        let dialect = self.dialects.get(name).copied().unwrap_or_default();
        Ok((conn, dialect))
    }
}

/// Run the dialect's lag query against one replica
pub async fn measure_lag(
    conn: &dyn Connection,
    dialect: Dialect,
    probe_timeout: Duration,
) -> CompuertaResult<Option<Duration>> {
    let Some(sql) = dialect.lag_query() else {
        return Ok(None);
    };

    let rows = tokio::time::timeout(probe_timeout, conn.query(sql, &[]))
        .await
        .map_err(|_| CompuertaError::timeout("replication lag query"))??;

    dialect.parse_lag(&rows).map(Some)
}
