use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::actor::mutation::MutationActor;
use crate::actor::query::{InfiniteQuery, PlainQuery, QueryActor};
use crate::actor::subscription::SubscriptionActor;
use crate::actor::{ActorContext, ManagedActor, Trigger};
use crate::builder::{SwrCacheBuilder, SwrCacheConfig};
use crate::caches::{StateCache, remove_matching};
use crate::entry::Entry;
use crate::environment::{
    EventObserver, EventProvider, MemoryPressure, MemoryPressureLevel, NetworkConnectivity,
    NetworkConnectivityEvent, WindowVisibility, WindowVisibilityEvent,
};
use crate::error::CacheError;
use crate::filter::{Activity, Filter, StatusPredicate};
use crate::id::UniqueId;
use crate::key::{InfiniteQueryKey, MutationKey, QueryChunks, QueryKey, SubscriptionKey};
use crate::metrics::MetricsSink;
use crate::priority_queue::PriorityQueue;
use crate::receiver::Receiver;
use crate::refs::{InfiniteQueryRef, MutationRef, QueryRef, SubscriptionRef};
use crate::snapshot::{CacheSnapshot, KeySnapshot};
use crate::state::{ErrorRecord, QueryState, QueryStatus};
use crate::store::ActorStore;

/// Everything [`SwrCacheBuilder`] collects before the cache starts.
pub(crate) struct CacheParts {
    pub(crate) config: SwrCacheConfig,
    pub(crate) receiver: Receiver,
    pub(crate) state_cache: Arc<dyn StateCache>,
    pub(crate) metrics: Option<Arc<dyn MetricsSink>>,
    pub(crate) memory_pressure: Arc<MemoryPressure>,
    pub(crate) window_visibility: Arc<WindowVisibility>,
    pub(crate) network_connectivity: Arc<NetworkConnectivity>,
}

/// Environment events forwarded to the background task.
#[derive(Debug, Clone, Copy)]
enum Signal {
    Memory(MemoryPressureLevel),
    Visibility(WindowVisibilityEvent),
    Network(NetworkConnectivityEvent),
}

type Detach = Box<dyn FnOnce() + Send>;

/// Stale-while-revalidate cache for queries, mutations and subscriptions.
///
/// Every key is served by one actor. The cache creates actors on demand,
/// destroys them after their keep-alive time and reacts to environment
/// events in a background task. Cloning is cheap; clones share one cache.
///
/// Must be built inside a tokio runtime.
///
/// # Example
///
/// ```ignore
/// let cache = SwrCache::builder()
///     .receiver(Receiver::new().with(HttpClient::new()))
///     .build();
///
/// let post = cache.get_query(GetPost(1))?;
/// let data = post.resolve().await?;
/// ```
#[derive(Clone)]
pub struct SwrCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: SwrCacheConfig,
    cx: ActorContext,
    queries: Arc<ActorStore>,
    mutations: Arc<ActorStore>,
    subscriptions: Arc<ActorStore>,
    network: watch::Sender<NetworkConnectivityEvent>,
    /// Keeps the signal channel open even when no provider holds an observer.
    _signals: mpsc::UnboundedSender<Signal>,
    background: Mutex<Option<JoinHandle<()>>>,
    observers: Mutex<Vec<Detach>>,
}

fn observe<E: Send + 'static>(
    provider: Arc<dyn EventProvider<E>>,
    signals: &mpsc::UnboundedSender<Signal>,
    wrap: fn(E) -> Signal,
) -> Detach {
    let signals = signals.clone();
    let observer: Arc<dyn EventObserver<E>> = Arc::new(move |event: E| {
        let _ = signals.send(wrap(event));
    });
    provider.add_observer(observer.clone());
    Box::new(move || provider.remove_observer(&observer))
}

impl SwrCache {
    pub fn builder() -> SwrCacheBuilder {
        SwrCacheBuilder::new()
    }

    pub(crate) fn start(parts: CacheParts) -> Self {
        let metrics = parts.metrics;
        let queries = Arc::new(ActorStore::new("query", metrics.clone()));
        let mutations = Arc::new(ActorStore::new("mutation", metrics.clone()));
        let subscriptions = Arc::new(ActorStore::new("subscription", metrics.clone()));

        let (network, network_rx) = watch::channel(NetworkConnectivityEvent::Available);
        let (relay, _) = broadcast::channel(parts.config.error_relay_capacity.max(1));
        let cx = ActorContext {
            receiver: Arc::new(parts.receiver),
            state_cache: parts.state_cache,
            network: network_rx,
            relay,
            metrics,
            queries: Arc::downgrade(&queries),
            state_capacity: parts.config.state_channel_capacity,
        };

        let (signals, signals_rx) = mpsc::unbounded_channel();
        let observers = vec![
            observe(parts.memory_pressure, &signals, Signal::Memory),
            observe(parts.window_visibility, &signals, Signal::Visibility),
            observe(parts.network_connectivity, &signals, Signal::Network),
        ];

        let inner = Arc::new(CacheInner {
            config: parts.config,
            cx,
            queries,
            mutations,
            subscriptions,
            network,
            _signals: signals,
            background: Mutex::new(None),
            observers: Mutex::new(observers),
        });
        let background = tokio::spawn(run_background(Arc::downgrade(&inner), signals_rx));
        *inner.background.lock() = Some(background);

        SwrCache { inner }
    }

    pub fn config(&self) -> &SwrCacheConfig {
        &self.inner.config
    }

    /// Subscribe to the query for `key`, creating its actor if needed.
    ///
    /// The query is fetched when it has no data yet, or when its data is stale
    /// and `revalidate_on_mount` is set.
    pub fn get_query<K: QueryKey>(&self, key: K) -> Result<QueryRef<K>, CacheError> {
        let id = key.id();
        let options = key.options().unwrap_or_else(|| self.inner.config.query.clone());
        let actor = self.inner.queries.get_or_create(&id, || {
            let initial_data = key.initial_data();
            QueryActor::spawn(
                id.clone(),
                PlainQuery(key),
                options,
                self.inner.cx.clone(),
                initial_data,
            )
        })?;
        Ok(QueryRef::connect(actor))
    }

    pub fn get_infinite_query<K: InfiniteQueryKey>(
        &self,
        key: K,
    ) -> Result<InfiniteQueryRef<K>, CacheError> {
        let id = key.id();
        let options = key.options().unwrap_or_else(|| self.inner.config.query.clone());
        let actor = self.inner.queries.get_or_create(&id, || {
            QueryActor::spawn(id.clone(), InfiniteQuery(key), options, self.inner.cx.clone(), None)
        })?;
        Ok(InfiniteQueryRef::connect(actor))
    }

    pub fn get_mutation<K: MutationKey>(&self, key: K) -> Result<MutationRef<K>, CacheError> {
        let id = key.id();
        let options = key.options().unwrap_or_else(|| self.inner.config.mutation.clone());
        let actor = self.inner.mutations.get_or_create(&id, || {
            MutationActor::spawn(id.clone(), key, options, self.inner.cx.clone())
        })?;
        Ok(MutationRef::connect(actor))
    }

    pub fn get_subscription<K: SubscriptionKey>(
        &self,
        key: K,
    ) -> Result<SubscriptionRef<K>, CacheError> {
        let id = key.id();
        let options = key.options().unwrap_or_else(|| self.inner.config.subscription.clone());
        let actor = self.inner.subscriptions.get_or_create(&id, || {
            SubscriptionActor::spawn(id.clone(), key, options, self.inner.cx.clone())
        })?;
        Ok(SubscriptionRef::connect(actor))
    }

    /// Fetch `key` ahead of use. The result stays cached for its keep-alive
    /// time and then in the inactive-state cache for its gc time.
    pub async fn prefetch_query<K: QueryKey>(&self, key: K) -> Result<(), CacheError> {
        let query = self.get_query(key)?;
        query.resolve().await.map(|_| ())
    }

    pub async fn prefetch_infinite_query<K: InfiniteQueryKey>(
        &self,
        key: K,
    ) -> Result<(), CacheError> {
        let query = self.get_infinite_query(key)?;
        query.resolve().await.map(|_| ())
    }

    /// The current reply for `key`, from its live actor or the inactive-state cache.
    pub async fn get_query_data<K: QueryKey>(&self, key: &K) -> Option<K::Data> {
        let id = key.id();
        if let Some(actor) = self.inner.queries.find::<QueryActor<PlainQuery<K>>>(&id) {
            return actor.state().reply;
        }
        self.cached_state::<K::Data>(&id).await.and_then(|state| state.reply)
    }

    pub async fn get_infinite_query_data<K: InfiniteQueryKey>(
        &self,
        key: &K,
    ) -> Option<QueryChunks<K::Data, K::Param>> {
        let id = key.id();
        if let Some(actor) = self.inner.queries.find::<QueryActor<InfiniteQuery<K>>>(&id) {
            return actor.state().reply;
        }
        self.cached_state::<QueryChunks<K::Data, K::Param>>(&id)
            .await
            .and_then(|state| state.reply)
    }

    /// Replace the reply for `key` with `update(current)`.
    ///
    /// A live actor applies the update in order with its other commands.
    /// Otherwise the cached state is rewritten so the next subscriber sees it.
    pub async fn set_query_data<K, F>(&self, key: &K, update: F) -> Result<(), CacheError>
    where
        K: QueryKey,
        F: FnOnce(Option<&K::Data>) -> K::Data + Send + 'static,
    {
        let id = key.id();
        if let Some(actor) = self.inner.queries.find::<QueryActor<PlainQuery<K>>>(&id) {
            actor.set_data(Box::new(update));
            return Ok(());
        }

        let options = key.options().unwrap_or_else(|| self.inner.config.query.clone());
        let current = self.cached_state::<K::Data>(&id).await.unwrap_or_default();
        let data = update(current.reply.as_ref());
        let now = Instant::now();
        let stale_at = now + options.stale_time;
        let state = QueryState {
            reply: Some(data),
            reply_updated_at: Some(now),
            error: None,
            stale_at: Some(stale_at),
            status: QueryStatus::Success,
            is_invalidated: false,
            ..current
        };
        self.inner
            .cx
            .state_cache
            .set(&id, Entry::new(state, Some(stale_at), now + options.gc_time))
            .await
    }

    async fn cached_state<T: Clone + Send + Sync + 'static>(
        &self,
        id: &UniqueId,
    ) -> Option<QueryState<T>> {
        match self.inner.cx.state_cache.get(id).await {
            Ok(entry) => entry.and_then(|entry| entry.typed::<QueryState<T>>()),
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "failed to read cached query state");
                None
            }
        }
    }

    /// Invalidate every live query matching `filter`. Returns how many matched.
    pub fn invalidate_queries(&self, filter: &Filter) -> usize {
        self.inner.queries.invalidate_by(filter)
    }

    /// Resume every live query matching `filter`. Returns how many matched.
    pub fn resume_queries(&self, filter: &Filter) -> usize {
        self.inner.queries.resume_by(filter)
    }

    /// Remove matching queries from the store and the inactive-state cache.
    pub async fn remove_queries(&self, filter: &Filter) -> Result<usize, CacheError> {
        let removed = self.inner.queries.remove_by(filter).len();
        let cached = remove_matching(self.inner.cx.state_cache.as_ref(), filter).await?;
        tracing::debug!(removed, cached, "removed queries");
        Ok(removed)
    }

    pub fn remove_mutations(&self, filter: &Filter) -> usize {
        self.inner.mutations.remove_by(filter).len()
    }

    pub async fn remove_subscriptions(&self, filter: &Filter) -> Result<usize, CacheError> {
        let removed = self.inner.subscriptions.remove_by(filter).len();
        remove_matching(self.inner.cx.state_cache.as_ref(), filter).await?;
        Ok(removed)
    }

    /// Failures of every key that does not suppress error relay.
    pub fn errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.inner.cx.relay.subscribe()
    }

    /// Summary of live actors and cached states.
    pub async fn snapshot(&self) -> CacheSnapshot {
        let cached_states = match self.inner.cx.state_cache.ids().await {
            Ok(ids) => ids.len(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to list cached states");
                0
            }
        };
        let collect = |store: &ActorStore| {
            let mut keys: Vec<KeySnapshot> =
                store.targets().into_iter().map(KeySnapshot::from).collect();
            keys.sort_by_key(|key| key.id.to_string());
            keys
        };
        CacheSnapshot {
            queries: collect(self.inner.queries.as_ref()),
            mutations: collect(self.inner.mutations.as_ref()),
            subscriptions: collect(self.inner.subscriptions.as_ref()),
            cached_states,
            online: *self.inner.network.borrow() == NetworkConnectivityEvent::Available,
        }
    }

    /// Stop the background task, destroy every actor and flush metrics.
    ///
    /// Refs still held keep their last state but receive no further updates.
    pub async fn close(&self) {
        self.inner.shutdown();
        if let Some(metrics) = &self.inner.cx.metrics
            && let Err(err) = metrics.flush().await
        {
            tracing::warn!(error = %err, "failed to flush metrics");
        }
        tracing::debug!("cache closed");
    }
}

impl CacheInner {
    fn shutdown(&self) {
        if let Some(background) = self.background.lock().take() {
            background.abort();
        }
        for detach in self.observers.lock().drain(..) {
            detach();
        }
        self.queries.clear();
        self.mutations.clear();
        self.subscriptions.clear();
    }

    async fn on_signal(&self, signal: Signal) {
        match signal {
            Signal::Memory(level) => self.on_memory_pressure(level).await,
            Signal::Visibility(WindowVisibilityEvent::Foreground) => {
                let filter = Filter::all()
                    .with_activity(Activity::Active)
                    .with_status(StatusPredicate::Stale);
                let count = self.queries.resume_on(&filter, Trigger::Focus);
                tracing::debug!(count, "window in foreground, revalidating stale queries");
            }
            Signal::Visibility(WindowVisibilityEvent::Background) => {
                tracing::trace!("window in background");
            }
            Signal::Network(event) => {
                let previous = self.network.send_replace(event);
                match (previous, event) {
                    (NetworkConnectivityEvent::Lost, NetworkConnectivityEvent::Available) => {
                        let filter = Filter::all()
                            .with_activity(Activity::Active)
                            .with_status(StatusPredicate::FailedOrPaused);
                        let queries = self.queries.resume_on(&filter, Trigger::Reconnect);
                        let subscriptions =
                            self.subscriptions.resume_on(&filter, Trigger::Reconnect);
                        tracing::debug!(queries, subscriptions, "network restored, resuming");
                    }
                    (NetworkConnectivityEvent::Available, NetworkConnectivityEvent::Lost) => {
                        tracing::warn!("network lost, network errors will not be retried");
                    }
                    _ => {}
                }
            }
        }
    }

    async fn on_memory_pressure(&self, level: MemoryPressureLevel) {
        let min_idle = match level {
            MemoryPressureLevel::Critical => Duration::ZERO,
            MemoryPressureLevel::Low | MemoryPressureLevel::Background => {
                self.config.idle_eviction_age
            }
        };
        let evicted = self.queries.evict_idle(min_idle)
            + self.mutations.evict_idle(min_idle)
            + self.subscriptions.evict_idle(min_idle);

        let result = match level {
            MemoryPressureLevel::Critical => self.cx.state_cache.clear().await.map(|()| 0),
            _ => self.cx.state_cache.purge_expired().await,
        };
        match result {
            Ok(purged) => tracing::debug!(?level, evicted, purged, "handled memory pressure"),
            Err(err) => tracing::warn!(?level, error = %err, "failed to trim inactive states"),
        }
    }

    /// Purge expired states and revalidate stale queries, earliest deadline first.
    async fn sweep(&self, permits: &Arc<Semaphore>) {
        match self.cx.state_cache.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "purged expired states"),
            Err(err) => tracing::warn!(error = %err, "failed to purge expired states"),
        }

        let now = Instant::now();
        let mut queue: PriorityQueue<Instant, Arc<dyn ManagedActor>> = PriorityQueue::new();
        for actor in self.queries.actors() {
            if let Some(deadline) = actor.revalidation_deadline() {
                queue.push(deadline, actor);
            }
        }

        while let Some((_, actor)) = queue.pop_if_due(now) {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                tracing::trace!(
                    remaining = queue.len() + 1,
                    "background revalidation limit reached"
                );
                break;
            };
            let Some(done) = actor.revalidate() else {
                continue;
            };
            tracing::trace!(id = %actor.id(), "background revalidation");
            tokio::spawn(async move {
                let _ = done.await;
                drop(permit);
            });
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_background(inner: Weak<CacheInner>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    let Some((sweep_interval, max_revalidations)) = inner
        .upgrade()
        .map(|inner| (inner.config.sweep_interval, inner.config.max_background_revalidations))
    else {
        return;
    };
    // A zero interval turns the sweep off; signals are still handled.
    let mut ticker = (!sweep_interval.is_zero()).then(|| {
        let mut ticker = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let permits = Arc::new(Semaphore::new(max_revalidations.max(1)));

    loop {
        tokio::select! {
            signal = signals.recv() => {
                let (Some(signal), Some(inner)) = (signal, inner.upgrade()) else {
                    break;
                };
                tracing::trace!(?signal, "environment signal");
                inner.on_signal(signal).await;
            }
            _ = next_tick(&mut ticker) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.sweep(&permits).await;
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
