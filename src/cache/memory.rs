/// In-memory cache backend with a byte budget
use super::CacheBackend;
use crate::error::{CacheError, CompuertaResult};
use crate::utils::{glob_match, BackgroundTask};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    /// Sum of stored value lengths
    size: usize,
}

impl Store {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.size -= entry.value.len();
                true
            }
            None => false,
        }
    }
}

/// Byte-budgeted map with lazy expiry and a periodic sweep
pub struct MemoryBackend {
    max_size: usize,
    store: RwLock<Store>,
    sweeper: Mutex<Option<BackgroundTask>>,
}

impl MemoryBackend {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            store: RwLock::new(Store::default()),
            sweeper: Mutex::new(None),
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.write().await;
        let expired: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            store.remove(key);
        }
        expired.len()
    }

    pub async fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.as_ref().is_some_and(|task| task.is_running()) {
            return;
        }

        let backend = Arc::clone(self);
        *sweeper = Some(BackgroundTask::spawn_periodic(
            "cache-sweeper",
            interval,
            move || {
                let backend = Arc::clone(&backend);
                async move {
                    let purged = backend.purge_expired().await;
                    if purged > 0 {
                        debug!(purged, "Purged expired cache entries");
                    }
                }
            },
        ));
        info!(interval = ?interval, "Started cache sweeper");
    }

    pub async fn stop_sweeper(&self) {
        if let Some(task) = self.sweeper.lock().await.take() {
            task.stop().await;
        }
    }

    pub async fn entry_count(&self) -> usize {
        self.store.read().await.entries.len()
    }

    /// Bytes currently stored
    pub async fn size(&self) -> usize {
        self.store.read().await.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> CompuertaResult<Vec<u8>> {
        let now = Instant::now();
        {
            let store = self.store.read().await;
            match store.entries.get(key) {
                None => return Err(CacheError::Miss.into()),
                Some(entry) if !entry.is_expired(now) => return Ok(entry.value.clone()),
                Some(_) => {}
            }
        }

        let mut store = self.store.write().await;
        if store.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            store.remove(key);
        }
        Err(CacheError::Miss.into())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CompuertaResult<()> {
        if value.len() > self.max_size {
            return Err(CacheError::SizeExceeded {
                size: value.len(),
                max: self.max_size,
            }
            .into());
        }

        let mut store = self.store.write().await;
        store.remove(key);

        // No recency ordering; evict whatever the map yields first
        while store.size + value.len() > self.max_size {
            let Some(victim) = store.entries.keys().next().cloned() else {
                break;
            };
            store.remove(&victim);
        }

        store.size += value.len();
        store.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CompuertaResult<bool> {
        Ok(self.store.write().await.remove(key))
    }

    async fn delete_pattern(&self, pattern: &str) -> CompuertaResult<usize> {
        let mut store = self.store.write().await;
        let matched: Vec<String> = store
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();

        for key in &matched {
            store.remove(key);
        }
        Ok(matched.len())
    }

    async fn exists(&self, key: &str) -> CompuertaResult<bool> {
        let now = Instant::now();
        let store = self.store.read().await;
        Ok(store.entries.get(key).is_some_and(|e| !e.is_expired(now)))
    }

    async fn clear(&self) -> CompuertaResult<()> {
        let mut store = self.store.write().await;
        store.entries.clear();
        store.size = 0;
        Ok(())
    }
}
