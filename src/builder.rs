//! Builder API for creating cache instances.
//!
//! Every setting has a default, so `SwrCacheBuilder::new().build()` gives a
//! working cache with no environment signals and an in-memory Moka state cache.

use std::sync::Arc;
use std::time::Duration;

use crate::caches::{MokaStateCache, StateCache};
use crate::environment::{MemoryPressure, NetworkConnectivity, Unsupported, WindowVisibility};
use crate::metrics::MetricsSink;
use crate::options::{MutationOptions, QueryOptions, SubscriptionOptions};
use crate::receiver::Receiver;
use crate::swr::{CacheParts, SwrCache};

/// Cache-wide settings.
#[derive(Debug, Clone)]
pub struct SwrCacheConfig {
    /// Defaults for keys that do not return their own options.
    pub query: QueryOptions,
    pub mutation: MutationOptions,
    pub subscription: SubscriptionOptions,
    /// How often the background task purges expired states and revalidates
    /// stale queries that opted into `revalidate_on_stale`. `Duration::ZERO`
    /// disables the sweep.
    pub sweep_interval: Duration,
    /// Upper bound on concurrent revalidations started by one sweep.
    pub max_background_revalidations: usize,
    /// On low memory pressure, actors idle for at least this long are evicted.
    pub idle_eviction_age: Duration,
    /// Buffer of the ordered state stream per actor. Slow observers that fall
    /// further behind miss snapshots.
    pub state_channel_capacity: usize,
    pub error_relay_capacity: usize,
}

impl Default for SwrCacheConfig {
    fn default() -> Self {
        SwrCacheConfig {
            query: QueryOptions::default(),
            mutation: MutationOptions::default(),
            subscription: SubscriptionOptions::default(),
            sweep_interval: Duration::from_secs(30),
            max_background_revalidations: 4,
            idle_eviction_age: Duration::from_secs(30),
            state_channel_capacity: 64,
            error_relay_capacity: 32,
        }
    }
}

/// Builder for [`SwrCache`].
///
/// # Example
///
/// ```ignore
/// use soil_query::{SwrCacheBuilder, Receiver, MokaStateCache, MokaStateCacheConfig};
/// use std::sync::Arc;
///
/// let network = Arc::new(EventSource::new());
///
/// let cache = SwrCacheBuilder::new()
///     .receiver(Receiver::new().with(client))
///     .state_cache(Arc::new(MokaStateCache::new(MokaStateCacheConfig {
///         max_capacity: 1_000,
///         time_to_live: None,
///     })))
///     .network_connectivity(network.clone())
///     .build();
/// ```
pub struct SwrCacheBuilder {
    config: SwrCacheConfig,
    receiver: Receiver,
    state_cache: Option<Arc<dyn StateCache>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    memory_pressure: Arc<MemoryPressure>,
    window_visibility: Arc<WindowVisibility>,
    network_connectivity: Arc<NetworkConnectivity>,
}

impl SwrCacheBuilder {
    pub fn new() -> Self {
        SwrCacheBuilder {
            config: SwrCacheConfig::default(),
            receiver: Receiver::new(),
            state_cache: None,
            metrics: None,
            memory_pressure: Arc::new(Unsupported),
            window_visibility: Arc::new(Unsupported),
            network_connectivity: Arc::new(Unsupported),
        }
    }

    pub fn config(mut self, config: SwrCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn query_options(mut self, options: QueryOptions) -> Self {
        self.config.query = options;
        self
    }

    pub fn mutation_options(mut self, options: MutationOptions) -> Self {
        self.config.mutation = options;
        self
    }

    pub fn subscription_options(mut self, options: SubscriptionOptions) -> Self {
        self.config.subscription = options;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Dependencies handed to every fetch, mutate and subscribe call.
    pub fn receiver(mut self, receiver: Receiver) -> Self {
        self.receiver = receiver;
        self
    }

    /// Where states of destroyed actors are kept.
    pub fn state_cache(mut self, state_cache: Arc<dyn StateCache>) -> Self {
        self.state_cache = Some(state_cache);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn memory_pressure(mut self, provider: Arc<MemoryPressure>) -> Self {
        self.memory_pressure = provider;
        self
    }

    pub fn window_visibility(mut self, provider: Arc<WindowVisibility>) -> Self {
        self.window_visibility = provider;
        self
    }

    pub fn network_connectivity(mut self, provider: Arc<NetworkConnectivity>) -> Self {
        self.network_connectivity = provider;
        self
    }

    /// Build the cache and start its background task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> SwrCache {
        let state_cache = self
            .state_cache
            .unwrap_or_else(|| Arc::new(MokaStateCache::default()));
        SwrCache::start(CacheParts {
            config: self.config,
            receiver: self.receiver,
            state_cache,
            metrics: self.metrics,
            memory_pressure: self.memory_pressure,
            window_visibility: self.window_visibility,
            network_connectivity: self.network_connectivity,
        })
    }
}

impl Default for SwrCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
