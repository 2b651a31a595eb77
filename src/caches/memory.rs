use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::caches::StateCache;
use crate::entry::Entry;
use crate::error::CacheError;
use crate::id::UniqueId;

/// Configuration for eviction on set operations.
#[derive(Debug, Clone)]
pub struct EvictOnSetConfig {
    /// Provide a number between 0 and 1 to calculate whether eviction should run on each set.
    ///
    /// - `1.0` -> run eviction on every `set`
    /// - `0.5` -> run eviction on every 2nd `set` (on average)
    /// - `0.0` -> disable eviction
    pub frequency: f64,

    /// Remove items until the number of items in the map is lower than `max_items`.
    pub max_items: usize,
}

/// Configuration for HashMapStateCache.
#[derive(Debug, Clone, Default)]
pub struct HashMapStateCacheConfig {
    /// Remove expired entries on every `set` operation.
    pub evict_on_set: Option<EvictOnSetConfig>,
}

/// Inactive-state cache using a HashMap behind an RwLock.
///
/// Suitable for the typical client workload of a few hundred keys. For large
/// key spaces with heavy churn, consider `MokaStateCache` instead.
pub struct HashMapStateCache {
    state: RwLock<HashMap<UniqueId, Entry>>,
    evict_on_set: Option<EvictOnSetConfig>,
}

impl HashMapStateCache {
    pub fn new(config: HashMapStateCacheConfig) -> Self {
        HashMapStateCache {
            state: RwLock::new(HashMap::new()),
            evict_on_set: config.evict_on_set,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }

    /// Run eviction if configured and random check passes.
    async fn maybe_evict(&self) {
        let Some(ref config) = self.evict_on_set else {
            return;
        };

        if config.frequency <= 0.0 {
            return;
        }

        let should_evict =
            config.frequency >= 1.0 || rand::thread_rng().r#gen::<f64>() < config.frequency;
        if !should_evict {
            return;
        }

        let mut state = self.state.write().await;
        let now = Instant::now();

        // First delete all expired entries
        state.retain(|_, entry| !entry.is_expired(now));

        // If still over max_items, remove the entries closest to expiry
        if state.len() > config.max_items {
            let mut entries: Vec<_> = state
                .iter()
                .map(|(id, entry)| (id.clone(), entry.expires_at))
                .collect();
            entries.sort_by_key(|(_, expires_at)| *expires_at);

            let to_remove = state.len() - config.max_items;
            for (id, _) in entries.into_iter().take(to_remove) {
                state.remove(&id);
            }
        }
    }
}

impl Default for HashMapStateCache {
    fn default() -> Self {
        Self::new(HashMapStateCacheConfig::default())
    }
}

#[async_trait]
impl StateCache for HashMapStateCache {
    fn name(&self) -> &'static str {
        "hashmap"
    }

    async fn get(&self, id: &UniqueId) -> Result<Option<Entry>, CacheError> {
        let state = self.state.read().await;

        let Some(entry) = state.get(id) else {
            return Ok(None);
        };

        if entry.is_expired(Instant::now()) {
            drop(state);
            self.state.write().await.remove(id);
            return Ok(None);
        }

        Ok(Some(entry.clone()))
    }

    async fn set(&self, id: &UniqueId, entry: Entry) -> Result<(), CacheError> {
        self.state.write().await.insert(id.clone(), entry);
        self.maybe_evict().await;
        Ok(())
    }

    async fn remove(&self, ids: &[UniqueId]) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        for id in ids {
            state.remove(id);
        }
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<UniqueId>, CacheError> {
        Ok(self.state.read().await.keys().cloned().collect())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let before = state.len();
        state.retain(|_, entry| !entry.is_expired(now));
        Ok(before - state.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.state.write().await.clear();
        Ok(())
    }
}
