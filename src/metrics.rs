//! Metrics for actors and the inactive-state cache.
//!
//! Actors emit [`CacheMetric::Fetch`], [`CacheMetric::Mutate`] and
//! [`CacheMetric::Evict`] to the sink configured on the cache. Wrapping a
//! [`StateCache`] in [`MetricsStateCache`] adds read/write/remove metrics.
//!
//! # Example
//!
//! ```ignore
//! let sink = Arc::new(MyMetricsSink::new());
//! let inner = Arc::new(MokaStateCache::default());
//! let state_cache: Arc<dyn StateCache> = Arc::new(MetricsStateCache::new(inner, sink.clone()));
//!
//! let cache = SwrCacheBuilder::new()
//!     .state_cache(state_cache)
//!     .metrics(sink)
//!     .build();
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::caches::StateCache;
use crate::entry::Entry;
use crate::error::CacheError;
use crate::id::{KeyKind, UniqueId};

/// How a fetch or mutation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Halted because the network is unavailable.
    Paused,
    Cancelled,
}

/// Status of an inactive-state entry on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryStatus {
    /// The cached reply is still fresh.
    Fresh,
    /// The cached reply is stale but usable.
    Stale,
}

/// Why actors were evicted from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Keep-alive elapsed with no subscribers.
    KeepAlive,
    MemoryPressure,
    Removed,
}

/// Metrics emitted by actors, stores and [`MetricsStateCache`].
#[derive(Debug, Clone)]
pub enum CacheMetric {
    /// Emitted when a query fetch (including its retries) finishes.
    Fetch {
        id: UniqueId,
        outcome: Outcome,
        latency_ms: f64,
    },
    /// Emitted when a mutation (including its retries) finishes.
    Mutate {
        id: UniqueId,
        outcome: Outcome,
        latency_ms: f64,
    },
    /// Emitted when actors leave a store.
    Evict {
        kind: KeyKind,
        count: usize,
        reason: EvictReason,
    },
    /// Emitted on every inactive-state read.
    Read {
        id: UniqueId,
        hit: bool,
        /// Status of the entry (only present when hit=true).
        status: Option<CacheEntryStatus>,
        latency_ms: f64,
        tier: String,
    },
    /// Emitted on every inactive-state write.
    Write {
        id: UniqueId,
        latency_ms: f64,
        tier: String,
    },
    /// Emitted on every inactive-state remove.
    Remove {
        /// Number of ids in the remove batch.
        id_count: usize,
        /// First id in the batch (for debugging/identification).
        first_id: Option<UniqueId>,
        latency_ms: f64,
        tier: String,
    },
}

/// Trait for receiving cache metrics.
///
/// # Example
///
/// ```ignore
/// struct BufferedSink {
///     buffer: Mutex<Vec<CacheMetric>>,
/// }
///
/// #[async_trait]
/// impl MetricsSink for BufferedSink {
///     fn emit(&self, metric: CacheMetric) {
///         self.buffer.lock().push(metric);
///     }
///
///     async fn flush(&self) -> Result<(), BoxError> {
///         // Send buffered metrics to your backend
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Emit a single metric.
    ///
    /// This is called synchronously from actor tasks.
    /// Implementations should be fast (e.g., buffer metrics in memory).
    fn emit(&self, metric: CacheMetric);

    /// Flush any buffered metrics.
    ///
    /// Called by [`SwrCache::close`](crate::SwrCache::close) and whenever the
    /// caller wants to ensure all metrics are persisted.
    async fn flush(&self) -> Result<(), crate::error::BoxError>;
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// A state cache wrapper that emits metrics for all operations.
pub struct MetricsStateCache {
    inner: Arc<dyn StateCache>,
    sink: Arc<dyn MetricsSink>,
    tier_name: String,
}

impl MetricsStateCache {
    /// Create a new MetricsStateCache wrapping the given cache.
    ///
    /// # Arguments
    /// * `inner` - The cache to wrap
    /// * `sink` - The metrics sink to emit metrics to
    pub fn new(inner: Arc<dyn StateCache>, sink: Arc<dyn MetricsSink>) -> Self {
        let tier_name = inner.name().to_string();
        MetricsStateCache {
            inner,
            sink,
            tier_name,
        }
    }

    /// Get a reference to the metrics sink.
    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }
}

#[async_trait]
impl StateCache for MetricsStateCache {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn get(&self, id: &UniqueId) -> Result<Option<Entry>, CacheError> {
        let start = Instant::now();
        let result = self.inner.get(id).await;
        let latency_ms = elapsed_ms(start);

        let (hit, status) = match &result {
            Ok(Some(entry)) => {
                let now = tokio::time::Instant::now();
                let status = if entry.is_fresh(now) {
                    Some(CacheEntryStatus::Fresh)
                } else if entry.is_stale(now) {
                    Some(CacheEntryStatus::Stale)
                } else {
                    None
                };
                (true, status)
            }
            Ok(None) | Err(_) => (false, None),
        };

        self.sink.emit(CacheMetric::Read {
            id: id.clone(),
            hit,
            status,
            latency_ms,
            tier: self.tier_name.clone(),
        });

        result
    }

    async fn set(&self, id: &UniqueId, entry: Entry) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.set(id, entry).await;

        self.sink.emit(CacheMetric::Write {
            id: id.clone(),
            latency_ms: elapsed_ms(start),
            tier: self.tier_name.clone(),
        });

        result
    }

    async fn remove(&self, ids: &[UniqueId]) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.remove(ids).await;

        self.sink.emit(CacheMetric::Remove {
            id_count: ids.len(),
            first_id: ids.first().cloned(),
            latency_ms: elapsed_ms(start),
            tier: self.tier_name.clone(),
        });

        result
    }

    async fn ids(&self) -> Result<Vec<UniqueId>, CacheError> {
        self.inner.ids().await
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        self.inner.purge_expired().await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear().await
    }
}
