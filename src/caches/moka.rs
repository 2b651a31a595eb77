use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use tokio::time::Instant;

use crate::caches::StateCache;
use crate::entry::Entry;
use crate::error::CacheError;
use crate::id::UniqueId;

/// Configuration for MokaStateCache.
#[derive(Debug, Clone)]
pub struct MokaStateCacheConfig {
    /// Maximum number of entries the cache can hold.
    pub max_capacity: u64,

    /// Time to live: entries are expired after this duration from insertion.
    /// `None` leaves expiry to each entry's `expires_at`.
    pub time_to_live: Option<Duration>,
}

impl Default for MokaStateCacheConfig {
    fn default() -> Self {
        MokaStateCacheConfig {
            max_capacity: 10_000,
            time_to_live: None,
        }
    }
}

/// Concurrent inactive-state cache backed by Moka.
///
/// Moka bounds the number of entries with its own admission and eviction
/// policy; per-entry expiry still follows `Entry::expires_at`.
pub struct MokaStateCache {
    cache: Cache<UniqueId, Entry>,
}

impl MokaStateCache {
    pub fn new(config: MokaStateCacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_capacity);

        if let Some(ttl) = config.time_to_live {
            builder = builder.time_to_live(ttl);
        }

        MokaStateCache {
            cache: builder.build(),
        }
    }

    /// Get cache statistics (for monitoring/debugging).
    pub fn stats(&self) -> (u64, u64) {
        (self.cache.entry_count(), self.cache.weighted_size())
    }
}

impl Default for MokaStateCache {
    fn default() -> Self {
        Self::new(MokaStateCacheConfig::default())
    }
}

#[async_trait]
impl StateCache for MokaStateCache {
    fn name(&self) -> &'static str {
        "moka"
    }

    async fn get(&self, id: &UniqueId) -> Result<Option<Entry>, CacheError> {
        match self.cache.get(id).await {
            Some(entry) if entry.is_expired(Instant::now()) => {
                self.cache.invalidate(id).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, id: &UniqueId, entry: Entry) -> Result<(), CacheError> {
        self.cache.insert(id.clone(), entry).await;
        Ok(())
    }

    async fn remove(&self, ids: &[UniqueId]) -> Result<(), CacheError> {
        for id in ids {
            self.cache.invalidate(id).await;
        }
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<UniqueId>, CacheError> {
        Ok(self.cache.iter().map(|(id, _)| (*id).clone()).collect())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let expired: Vec<UniqueId> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| (*id).clone())
            .collect();
        for id in &expired {
            self.cache.invalidate(id).await;
        }
        Ok(expired.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}
