use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// A state snapshot kept after its actor was destroyed.
///
/// The snapshot is type-erased so a single [`StateCache`](crate::caches::StateCache)
/// can hold states of every key type. Cloning only bumps a reference count.
#[derive(Clone)]
pub struct Entry {
    /// The cached state, e.g. a `QueryState<T>`.
    pub state: Arc<dyn Any + Send + Sync>,

    /// Before this instant the cached reply is fresh and can be served without
    /// revalidation. `None` means it is already stale.
    pub stale_at: Option<Instant>,

    /// Do not use the entry after this instant.
    /// Store implementations evict expired entries on their own schedule.
    pub expires_at: Instant,
}

impl Entry {
    pub fn new<S>(state: S, stale_at: Option<Instant>, expires_at: Instant) -> Self
    where
        S: Send + Sync + 'static,
    {
        Entry {
            state: Arc::new(state),
            stale_at,
            expires_at,
        }
    }

    /// Clone the snapshot back out if it has type `S`.
    pub fn typed<S>(&self) -> Option<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.state.downcast_ref::<S>().cloned()
    }

    /// Check if the entry is still fresh (not yet stale).
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.stale_at.is_some_and(|at| now < at) && !self.is_expired(now)
    }

    /// Check if the entry is stale but still usable.
    pub fn is_stale(&self, now: Instant) -> bool {
        !self.is_fresh(now) && !self.is_expired(now)
    }

    /// Check if the entry has expired and should not be used.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("stale_at", &self.stale_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
