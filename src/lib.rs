//! soil-query - A stale-while-revalidate query, mutation and subscription cache for Rust
//!
//! This library provides:
//! - One actor per key, so concurrent requests for a key share one fetch
//! - Stale-while-revalidate semantics with retries and exponential backoff
//! - Infinite (paginated) queries, mutations with query effects and subscriptions
//! - Keep-alive based actor lifetimes with an inactive-state cache behind them
//! - Reactions to memory pressure, window visibility and network connectivity
//!
//! # Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use soil_query::{BoxError, QueryKey, Receiver, SwrCache, UniqueId};
//!
//! struct GetUser(u64);
//!
//! #[async_trait]
//! impl QueryKey for GetUser {
//!     type Data = String;
//!
//!     fn id(&self) -> UniqueId {
//!         UniqueId::query("users").with_tag("user_id", self.0)
//!     }
//!
//!     async fn fetch(&self, receiver: &Receiver) -> Result<String, BoxError> {
//!         let db = receiver.get::<Database>()?;
//!         Ok(db.load_user(self.0).await?)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), soil_query::CacheError> {
//!     let cache = SwrCache::builder()
//!         .receiver(Receiver::new().with(Database::connect()))
//!         .build();
//!
//!     // Both refs share one actor and one fetch.
//!     let a = cache.get_query(GetUser(123))?;
//!     let b = cache.get_query(GetUser(123))?;
//!     let user = a.resolve().await?;
//!     assert_eq!(b.state().reply, Some(user));
//!     Ok(())
//! }
//! ```

mod actor;
mod builder;
pub mod caches;
mod entry;
mod environment;
mod error;
mod filter;
mod id;
mod key;
pub mod metrics;
mod options;
mod priority_queue;
mod receiver;
mod refs;
mod retry;
mod sharing;
mod snapshot;
mod state;
mod store;
mod swr;

// Re-export public API
pub use builder::{SwrCacheBuilder, SwrCacheConfig};
pub use caches::{
    EvictOnSetConfig, HashMapStateCache, HashMapStateCacheConfig, MokaStateCache,
    MokaStateCacheConfig, StateCache,
};
pub use entry::Entry;
pub use environment::{
    EventObserver, EventProvider, EventSource, MemoryPressure, MemoryPressureLevel,
    NetworkConnectivity, NetworkConnectivityEvent, Unsupported, WindowVisibility,
    WindowVisibilityEvent,
};
pub use error::{BoxError, CacheError};
pub use filter::{Activity, Filter, FilterTarget, StatusPredicate};
pub use id::{KeyKind, UniqueId};
pub use key::{
    InfiniteQueryKey, MutationKey, QueryChunk, QueryChunks, QueryEffect, QueryKey, SubscriptionKey,
};
pub use metrics::{CacheMetric, MetricsSink, MetricsStateCache};
pub use options::{MutationOptions, QueryOptions, SubscriptionOptions};
pub use priority_queue::{PriorityQueue, Token};
pub use receiver::Receiver;
pub use refs::{InfiniteQueryRef, MutationRef, QueryRef, SubscriptionRef};
pub use retry::{FixedRandomizer, Randomizer, RetryOptions, RetryPredicate, ThreadRandomizer};
pub use sharing::{ActorSharingStarted, SharingCommand};
pub use snapshot::{CacheSnapshot, KeySnapshot};
pub use state::{
    ErrorRecord, FetchStatus, MutationState, MutationStatus, QueryState, QueryStatus, Reply,
    SubscriptionState, SubscriptionStatus,
};
pub use swr::SwrCache;
