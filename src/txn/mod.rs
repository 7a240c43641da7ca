/// Managed transactions with savepoints, panic safety and retry
use crate::core::{ConnectionHandle, ExecResult, IsolationLevel, Rows, Transaction, TxOptions, Value};
use crate::error::{CompuertaError, CompuertaResult, TransactionError};
use crate::utils::generate_id;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};

/// Transaction manager defaults
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// Per-attempt deadline
    pub timeout: Option<Duration>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            timeout: None,
        }
    }
}

/// Per-call overrides for `execute_in_transaction`
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    pub tx: TxOptions,
    /// Falls back to the manager's `max_retries`
    pub max_retries: Option<u32>,
    /// Falls back to the manager's `timeout`
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Active => write!(f, "active"),
            TxState::Committed => write!(f, "committed"),
            TxState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Registry entry for an open transaction
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTransaction {
    pub id: String,
    pub isolation: IsolationLevel,
    pub started_at: SystemTime,
}

type Registry = Arc<Mutex<HashMap<String, ActiveTransaction>>>;

/// A driver transaction tracked by the manager
pub struct ManagedTransaction {
    id: String,
    /// Taken by `Drop` to roll back a transaction abandoned while active
    tx: Option<Box<dyn Transaction>>,
    started: Instant,
    isolation: IsolationLevel,
    savepoints: Vec<String>,
    state: TxState,
    registry: Registry,
}

impl fmt::Debug for ManagedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTransaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("state", &self.state)
            .field("savepoints", &self.savepoints)
            .finish_non_exhaustive()
    }
}

fn valid_savepoint_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ManagedTransaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Active savepoints, oldest first
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    fn ensure_active(&self) -> CompuertaResult<()> {
        match self.state {
            TxState::Active => Ok(()),
            TxState::Committed => Err(TransactionError::AlreadyCommitted {
                id: self.id.clone(),
            }
            .into()),
            TxState::RolledBack => Err(TransactionError::AlreadyRolledBack {
                id: self.id.clone(),
            }
            .into()),
        }
    }

    fn driver(&mut self) -> CompuertaResult<&mut (dyn Transaction + 'static)> {
        match self.tx.as_deref_mut() {
            Some(tx) => Ok(tx),
            None => Err(CompuertaError::internal(format!(
                "transaction {} lost its driver handle",
                self.id
            ))),
        }
    }

    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.savepoints.clear();
        self.registry.lock().remove(&self.id);
    }

    pub async fn query(&mut self, sql: &str, args: &[Value]) -> CompuertaResult<Rows> {
        self.ensure_active()?;
        self.driver()?.query(sql, args).await
    }

    pub async fn exec(&mut self, sql: &str, args: &[Value]) -> CompuertaResult<ExecResult> {
        self.ensure_active()?;
        self.driver()?.exec(sql, args).await
    }

    /// Commit. A failed commit leaves the transaction rolled back.
    pub async fn commit(&mut self) -> CompuertaResult<()> {
        self.ensure_active()?;
        let committed = self.driver()?.commit().await;
        match committed {
            Ok(()) => {
                debug!(txn = %self.id, elapsed = ?self.elapsed(), "Transaction committed");
                self.finish(TxState::Committed);
                Ok(())
            }
            Err(e) => {
                let rolled_back = match self.driver() {
                    Ok(tx) => tx.rollback().await,
                    Err(missing) => Err(missing),
                };
                if let Err(rollback_err) = rolled_back {
                    debug!(txn = %self.id, error = %rollback_err, "Rollback after failed commit failed");
                }
                self.finish(TxState::RolledBack);
                Err(e)
            }
        }
    }

    /// Roll back. Rolling back twice is a no-op.
    pub async fn rollback(&mut self) -> CompuertaResult<()> {
        match self.state {
            TxState::RolledBack => return Ok(()),
            TxState::Committed => {
                return Err(TransactionError::AlreadyCommitted {
                    id: self.id.clone(),
                }
                .into())
            }
            TxState::Active => {}
        }

        let result = match self.driver() {
            Ok(tx) => tx.rollback().await,
            Err(missing) => Err(missing),
        };
        self.finish(TxState::RolledBack);
        debug!(txn = %self.id, "Transaction rolled back");
        result
    }

    pub async fn savepoint(&mut self, name: &str) -> CompuertaResult<()> {
        self.ensure_active()?;
        if !valid_savepoint_name(name) {
            return Err(TransactionError::InvalidSavepoint {
                name: name.to_string(),
            }
            .into());
        }

        self.driver()?
            .exec(&format!("SAVEPOINT {name}"), &[])
            .await?;
        self.savepoints.push(name.to_string());
        Ok(())
    }

    fn savepoint_position(&self, name: &str) -> CompuertaResult<usize> {
        self.savepoints
            .iter()
            .rposition(|s| s == name)
            .ok_or_else(|| {
                TransactionError::SavepointNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Undo work since `name`. The savepoint stays, later ones are discarded.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> CompuertaResult<()> {
        self.ensure_active()?;
        let position = self.savepoint_position(name)?;
        self.driver()?
            .exec(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await?;
        self.savepoints.truncate(position + 1);
        Ok(())
    }

    /// Release `name` and every savepoint created after it
    pub async fn release_savepoint(&mut self, name: &str) -> CompuertaResult<()> {
        self.ensure_active()?;
        let position = self.savepoint_position(name)?;
        self.driver()?
            .exec(&format!("RELEASE SAVEPOINT {name}"), &[])
            .await?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn rollback_quietly(&mut self) {
        if !self.is_active() {
            return;
        }
        if let Err(e) = self.rollback().await {
            warn!(txn = %self.id, error = %e, "Rollback failed");
        }
    }
}

impl Drop for ManagedTransaction {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
        if self.state != TxState::Active {
            return;
        }
        let Some(mut tx) = self.tx.take() else {
            return;
        };

        // Cancelled futures land here; roll back on the runtime if there is one
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(txn = %self.id, "Transaction dropped while active, rolling back");
                let id = self.id.clone();
                handle.spawn(async move {
                    if let Err(e) = tx.rollback().await {
                        warn!(txn = %id, error = %e, "Rollback of dropped transaction failed");
                    }
                });
            }
            Err(_) => {
                warn!(txn = %self.id, "Transaction dropped outside a runtime, rollback skipped");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Opens managed transactions on one connection
pub struct TransactionManager {
    conn: ConnectionHandle,
    config: TransactionConfig,
    registry: Registry,
}

impl TransactionManager {
    pub fn new(conn: ConnectionHandle, config: TransactionConfig) -> Self {
        Self {
            conn,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub async fn begin(&self, opts: TxOptions) -> CompuertaResult<ManagedTransaction> {
        let tx = self.conn.begin_tx(opts).await?;
        let id = generate_id("txn");
        self.registry.lock().insert(
            id.clone(),
            ActiveTransaction {
                id: id.clone(),
                isolation: opts.isolation,
                started_at: SystemTime::now(),
            },
        );
        debug!(txn = %id, isolation = %opts.isolation, "Transaction started");

        Ok(ManagedTransaction {
            id,
            tx: Some(tx),
            started: Instant::now(),
            isolation: opts.isolation,
            savepoints: Vec::new(),
            state: TxState::Active,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Run `f` in a transaction, committing on success and rolling back on error.
    ///
    /// Retryable failures are retried after `retry_delay`, up to `max_retries`
    /// extra attempts. A panic in `f` rolls back and is returned as
    /// `TransactionError::Panicked`.
    pub async fn execute_in_transaction<F, T>(
        &self,
        opts: TransactionOptions,
        mut f: F,
    ) -> CompuertaResult<T>
    where
        F: for<'t> FnMut(&'t mut ManagedTransaction) -> BoxFuture<'t, CompuertaResult<T>> + Send,
        T: Send,
    {
        let max_retries = opts.max_retries.unwrap_or(self.config.max_retries);
        let mut attempt = 0;

        loop {
            let err = match self.attempt(&opts, &mut f).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_retries {
                if attempt == 0 {
                    return Err(err);
                }
                return Err(TransactionError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: err.to_string(),
                }
                .into());
            }

            attempt += 1;
            warn!(attempt, max_retries, error = %err, "Retrying transaction");
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    async fn attempt<F, T>(&self, opts: &TransactionOptions, f: &mut F) -> CompuertaResult<T>
    where
        F: for<'t> FnMut(&'t mut ManagedTransaction) -> BoxFuture<'t, CompuertaResult<T>> + Send,
        T: Send,
    {
        let mut tx = self.begin(opts.tx).await?;
        let deadline = opts.timeout.or(self.config.timeout);

        let outcome = {
            let tx_ref = &mut tx;
            let run = AssertUnwindSafe(async move { f(tx_ref).await }).catch_unwind();
            match deadline {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        match outcome {
            None => {
                tx.rollback_quietly().await;
                Err(CompuertaError::timeout(format!("transaction {}", tx.id())))
            }
            Some(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                error!(txn = %tx.id(), panic = %message, "Transaction callback panicked");
                tx.rollback_quietly().await;
                Err(TransactionError::Panicked { message }.into())
            }
            Some(Ok(Err(e))) => {
                tx.rollback_quietly().await;
                Err(e)
            }
            Some(Ok(Ok(value))) => {
                if tx.is_active() {
                    tx.commit().await?;
                }
                Ok(value)
            }
        }
    }

    pub fn get_active_txn_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn get_active_txn_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_active_transactions(&self) -> Vec<ActiveTransaction> {
        self.registry.lock().values().cloned().collect()
    }
}
