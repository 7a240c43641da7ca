/// Scripted in-memory connection used by unit tests
use super::{Connection, ExecResult, PoolStats, Rows, Transaction, TxOptions, Value};
use crate::config::DatabaseConfig;
use crate::core::ConnectionFactory;
use crate::error::{CompuertaError, CompuertaResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    None,
    Connection,
    Query,
}

#[derive(Default)]
pub struct MockState {
    pub statements: Mutex<Vec<String>>,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub begins: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

pub struct MockConnection {
    pub name: String,
    pub state: Arc<MockState>,
    fail_ping: AtomicBool,
    closed: AtomicBool,
    fail_close: AtomicBool,
    failure: Mutex<FailureMode>,
    fail_begins: AtomicU32,
    fail_commits: AtomicU32,
    delay: Mutex<Option<Duration>>,
    responses: Mutex<HashMap<String, Rows>>,
}

impl MockConnection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(MockState::default()),
            fail_ping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            failure: Mutex::new(FailureMode::None),
            fail_begins: AtomicU32::new(0),
            fail_commits: AtomicU32::new(0),
            delay: Mutex::new(None),
            responses: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn set_ping_failing(&self, failing: bool) {
        self.fail_ping.store(failing, Ordering::SeqCst);
    }

    pub fn set_failure(&self, mode: FailureMode) {
        *self.failure.lock() = mode;
    }

    pub fn set_close_failing(&self, failing: bool) {
        self.fail_close.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next_begins(&self, count: u32) {
        self.fail_begins.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn respond(&self, sql: &str, rows: Rows) {
        self.responses.lock().insert(sql.to_string(), rows);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }

    pub fn source_rows(name: &str) -> Rows {
        Rows::new(vec!["source".to_string()], vec![vec![Value::from(name)]])
    }

    fn check_failure(&self) -> CompuertaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CompuertaError::Closed {
                name: self.name.clone(),
            });
        }
        match *self.failure.lock() {
            FailureMode::None => Ok(()),
            FailureMode::Connection => Err(CompuertaError::connection(&self.name, "connection reset")),
            FailureMode::Query => Err(CompuertaError::query(format!("{} rejected statement", self.name))),
        }
    }

    async fn run(&self, sql: &str) -> CompuertaResult<()> {
        self.state.statements.lock().push(sql.to_string());
        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.check_failure()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, _args: &[Value]) -> CompuertaResult<Rows> {
        self.run(sql).await?;
        let scripted = self.responses.lock().get(sql).cloned();
        Ok(scripted.unwrap_or_else(|| Self::source_rows(&self.name)))
    }

    async fn exec(&self, sql: &str, _args: &[Value]) -> CompuertaResult<ExecResult> {
        self.run(sql).await?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn begin_tx(&self, _opts: TxOptions) -> CompuertaResult<Box<dyn Transaction>> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_begins.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_begins.store(remaining - 1, Ordering::SeqCst);
            return Err(CompuertaError::connection(&self.name, "begin failed"));
        }
        self.check_failure()?;
        Ok(Box::new(MockTransaction {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            fail_commit: {
                let remaining = self.fail_commits.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_commits.store(remaining - 1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            },
        }))
    }

    async fn ping(&self) -> CompuertaResult<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(CompuertaError::connection(&self.name, "ping failed"));
        }
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            max_open_connections: 10,
            open_connections: 1,
            in_use: self.state.in_flight.load(Ordering::SeqCst) as u32,
            idle: 1,
            wait_count: 0,
        }
    }

    async fn close(&self) -> CompuertaResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(CompuertaError::connection(&self.name, "close failed"));
        }
        Ok(())
    }
}

pub struct MockTransaction {
    name: String,
    state: Arc<MockState>,
    fail_commit: bool,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn query(&mut self, sql: &str, _args: &[Value]) -> CompuertaResult<Rows> {
        self.state.statements.lock().push(sql.to_string());
        Ok(MockConnection::source_rows(&self.name))
    }

    async fn exec(&mut self, sql: &str, _args: &[Value]) -> CompuertaResult<ExecResult> {
        self.state.statements.lock().push(sql.to_string());
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn commit(&mut self) -> CompuertaResult<()> {
        if self.fail_commit {
            return Err(CompuertaError::connection(&self.name, "commit lost connection"));
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> CompuertaResult<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that hands out mock connections keyed by `DatabaseConfig::host`
#[derive(Default)]
pub struct MockFactory {
    pub connections: Mutex<HashMap<String, Arc<MockConnection>>>,
    pub unreachable: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn connection(&self, host: &str) -> Option<Arc<MockConnection>> {
        self.connections.lock().get(host).cloned()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, config: &DatabaseConfig) -> CompuertaResult<Arc<dyn Connection>> {
        if self.unreachable.lock().contains(&config.host) {
            return Err(CompuertaError::connection(&config.host, "dial failed"));
        }
        let conn = self
            .connections
            .lock()
            .entry(config.host.clone())
            .or_insert_with(|| MockConnection::arc(&config.host))
            .clone();
        Ok(conn)
    }
}
