//! Backends for the inactive-state cache.
//!
//! When an actor is destroyed its last state is written here. Re-creating the
//! actor within the entry's lifetime resumes from that state instead of
//! fetching from scratch.

use async_trait::async_trait;

use crate::entry::Entry;
use crate::error::CacheError;
use crate::filter::Filter;
use crate::id::UniqueId;

pub mod memory;
pub mod moka;

pub use memory::{EvictOnSetConfig, HashMapStateCache, HashMapStateCacheConfig};
pub use moka::{MokaStateCache, MokaStateCacheConfig};

/// Common interface for storing, reading and deleting inactive states.
///
/// The implementation is responsible for cleaning up expired entries on its
/// own; `get` must never return an entry past its `expires_at`.
#[async_trait]
pub trait StateCache: Send + Sync {
    /// A name for metrics/tracing.
    ///
    /// # Example
    /// - "hashmap"
    /// - "moka"
    fn name(&self) -> &'static str;

    /// Return the cached entry. The response must be `None` for misses.
    async fn get(&self, id: &UniqueId) -> Result<Option<Entry>, CacheError>;

    /// Store the entry for `id`, replacing any previous one.
    async fn set(&self, id: &UniqueId, entry: Entry) -> Result<(), CacheError>;

    /// Removes the id(s) from the cache.
    async fn remove(&self, ids: &[UniqueId]) -> Result<(), CacheError>;

    /// Ids of every entry currently held, expired or not.
    async fn ids(&self) -> Result<Vec<UniqueId>, CacheError>;

    /// Drop every expired entry. Returns how many were dropped.
    async fn purge_expired(&self) -> Result<usize, CacheError>;

    /// Drop everything.
    async fn clear(&self) -> Result<(), CacheError>;
}

/// Remove every cached state whose id matches `filter`. Returns how many were removed.
pub(crate) async fn remove_matching(
    cache: &dyn StateCache,
    filter: &Filter,
) -> Result<usize, CacheError> {
    let ids: Vec<UniqueId> = cache
        .ids()
        .await?
        .into_iter()
        .filter(|id| filter.matches_id(id))
        .collect();
    if !ids.is_empty() {
        cache.remove(&ids).await?;
    }
    Ok(ids.len())
}
