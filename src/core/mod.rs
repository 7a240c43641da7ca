/// Core abstractions shared by every routing component
///
/// A `Connection` is one live database handle produced by an external
/// `ConnectionFactory`. Pools, shards and transactions only ever talk to
/// databases through these traits.
#[cfg(test)]
pub(crate) mod testing;

use crate::config::DatabaseConfig;
use crate::error::CompuertaResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A bound statement argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl Value {
    /// Numeric view used when reading scalar results such as replication lag
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// A fully materialized result set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a value by row index and column name
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
}

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Driver-side pool statistics for one connection handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_open_connections: u32,
    pub open_connections: u32,
    pub in_use: u32,
    pub idle: u32,
    pub wait_count: u64,
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Default => write!(f, "DEFAULT"),
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Options passed to `Connection::begin_tx`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

/// One live database connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a statement that returns rows
    async fn query(&self, sql: &str, args: &[Value]) -> CompuertaResult<Rows>;

    /// Run a statement that returns at most one row
    async fn query_row(&self, sql: &str, args: &[Value]) -> CompuertaResult<Option<Vec<Value>>> {
        let rows = self.query(sql, args).await?;
        Ok(rows.rows.into_iter().next())
    }

    /// Run a statement that modifies data
    async fn exec(&self, sql: &str, args: &[Value]) -> CompuertaResult<ExecResult>;

    /// Begin a driver transaction
    async fn begin_tx(&self, opts: TxOptions) -> CompuertaResult<Box<dyn Transaction>>;

    /// Round-trip to the server
    async fn ping(&self) -> CompuertaResult<()>;

    /// Driver pool statistics
    fn stats(&self) -> PoolStats;

    /// Release the handle
    async fn close(&self) -> CompuertaResult<()>;
}

/// A raw driver transaction
#[async_trait]
pub trait Transaction: Send {
    async fn query(&mut self, sql: &str, args: &[Value]) -> CompuertaResult<Rows>;

    async fn exec(&mut self, sql: &str, args: &[Value]) -> CompuertaResult<ExecResult>;

    async fn commit(&mut self) -> CompuertaResult<()>;

    async fn rollback(&mut self) -> CompuertaResult<()>;
}

/// Opens connections from structured configuration
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, config: &DatabaseConfig) -> CompuertaResult<Arc<dyn Connection>>;
}

/// Shared handle to a connection
pub type ConnectionHandle = Arc<dyn Connection>;
