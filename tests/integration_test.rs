//! Integration tests for soil-query driven through the public cache API.
//!
//! All tests run on a paused tokio clock, so keep-alive windows, stale times
//! and retry backoff elapse instantly and deterministically.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use soil_query::{
    BoxError, CacheError, CacheMetric, Entry, EventSource, Filter, FixedRandomizer,
    HashMapStateCache, InfiniteQueryKey, MemoryPressureLevel, MetricsSink, MutationKey,
    NetworkConnectivityEvent, QueryChunks, QueryEffect, QueryKey, QueryOptions, Receiver,
    RetryOptions, StateCache, SubscriptionKey, SwrCache, SwrCacheBuilder, UniqueId,
    WindowVisibilityEvent,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// Fake Origin
// ============================================================================

/// Backend shared by every key through the receiver.
#[derive(Default)]
struct Origin {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Fail this many calls before succeeding again.
    failures_left: AtomicUsize,
    offline: AtomicBool,
}

impl Origin {
    async fn load(&self, what: &str) -> Result<String, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::network("connection refused").into());
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(std::io::Error::other("origin unavailable").into());
        }
        Ok(format!("{} v{}", what, call))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Keys
// ============================================================================

struct GetPost(u64);

#[async_trait]
impl QueryKey for GetPost {
    type Data = String;

    fn id(&self) -> UniqueId {
        UniqueId::query("posts/detail").with_tag("post_id", self.0)
    }

    async fn fetch(&self, receiver: &Receiver) -> Result<String, BoxError> {
        let origin = receiver.get::<Origin>()?;
        origin.load(&format!("post {}", self.0)).await
    }
}

/// Same id as `GetPost`, different key type.
struct PostTitle(u64);

#[async_trait]
impl QueryKey for PostTitle {
    type Data = usize;

    fn id(&self) -> UniqueId {
        UniqueId::query("posts/detail").with_tag("post_id", self.0)
    }

    async fn fetch(&self, _receiver: &Receiver) -> Result<usize, BoxError> {
        Ok(0)
    }
}

struct Feed {
    pages: u32,
}

#[async_trait]
impl InfiniteQueryKey for Feed {
    type Data = String;
    type Param = u32;

    fn id(&self) -> UniqueId {
        UniqueId::infinite_query("posts/feed")
    }

    fn initial_param(&self) -> u32 {
        0
    }

    async fn fetch(&self, receiver: &Receiver, page: u32) -> Result<String, BoxError> {
        let origin = receiver.get::<Origin>()?;
        origin.load(&format!("page {}", page)).await
    }

    fn load_more_param(&self, chunks: &QueryChunks<String, u32>) -> Option<u32> {
        let next = chunks.last()?.param + 1;
        (next < self.pages).then_some(next)
    }
}

struct EditPost;

#[async_trait]
impl MutationKey for EditPost {
    type Data = String;
    type Variable = (u64, String);

    fn id(&self) -> UniqueId {
        UniqueId::mutation("posts/edit")
    }

    async fn mutate(
        &self,
        receiver: &Receiver,
        (post_id, body): (u64, String),
    ) -> Result<String, BoxError> {
        let origin = receiver.get::<Origin>()?;
        origin.load(&format!("edit {} {}", post_id, body)).await
    }

    fn on_query_update(&self, (post_id, _): &(u64, String), _data: &String) -> Vec<QueryEffect> {
        vec![QueryEffect::Invalidate(
            Filter::namespace("posts/detail").with_tag("post_id", post_id),
        )]
    }
}

struct Ticker;

impl SubscriptionKey for Ticker {
    type Data = u32;

    fn id(&self) -> UniqueId {
        UniqueId::subscription("ticker")
    }

    fn subscribe(&self, _receiver: &Receiver) -> BoxStream<'static, Result<u32, BoxError>> {
        stream::iter(1..=3)
            .then(|n| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(n)
            })
            .boxed()
    }
}

#[derive(Default)]
struct RecordingSink {
    metrics: Mutex<Vec<CacheMetric>>,
    flushes: AtomicUsize,
}

#[async_trait]
impl MetricsSink for RecordingSink {
    fn emit(&self, metric: CacheMetric) {
        self.metrics.lock().push(metric);
    }

    async fn flush(&self) -> Result<(), BoxError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Saves take a while, like a remote cache would.
struct SlowStateCache {
    inner: HashMapStateCache,
    delay: Duration,
}

#[async_trait]
impl StateCache for SlowStateCache {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn get(&self, id: &UniqueId) -> Result<Option<Entry>, CacheError> {
        self.inner.get(id).await
    }

    async fn set(&self, id: &UniqueId, entry: Entry) -> Result<(), CacheError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(id, entry).await
    }

    async fn remove(&self, ids: &[UniqueId]) -> Result<(), CacheError> {
        self.inner.remove(ids).await
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

// ============================================================================
// Helper Functions
// ============================================================================

fn query_options() -> QueryOptions {
    QueryOptions {
        stale_time: Duration::from_secs(10),
        keep_alive_time: Duration::from_secs(1),
        retry: RetryOptions {
            retry_count: 3,
            initial_interval: Duration::from_millis(100),
            randomizer: Arc::new(FixedRandomizer(0.5)),
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Harness {
    cache: SwrCache,
    origin: Arc<Origin>,
    state_cache: Arc<HashMapStateCache>,
}

fn harness(configure: impl FnOnce(SwrCacheBuilder) -> SwrCacheBuilder) -> Harness {
    let origin = Arc::new(Origin::default());
    let state_cache = Arc::new(HashMapStateCache::default());
    let mut receiver = Receiver::new();
    receiver.insert(origin.clone());

    let builder = SwrCache::builder()
        .receiver(receiver)
        .state_cache(state_cache.clone())
        .query_options(query_options());
    Harness {
        cache: configure(builder).build(),
        origin,
        state_cache,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ============================================================================
// Queries
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_concurrent_refs_share_one_fetch() {
    let h = harness(|b| b);

    let a = h.cache.get_query(GetPost(1)).unwrap();
    let b = h.cache.get_query(GetPost(1)).unwrap();
    let (first, second) = tokio::join!(a.resolve(), b.resolve());

    assert_eq!(first.unwrap(), "post 1 v1");
    assert_eq!(second.unwrap(), "post 1 v1");
    assert_eq!(h.origin.calls(), 1);
    assert_eq!(h.cache.snapshot().await.queries[0].subscribers, 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_fresh_reply_is_served_without_fetching() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let other = h.cache.get_query(GetPost(1)).unwrap();
    assert_eq!(other.resolve().await.unwrap(), "post 1 v1");
    assert_eq!(h.origin.calls(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_failures_are_retried_until_success() {
    let h = harness(|b| b);
    h.origin.failures_left.store(3, Ordering::SeqCst);

    let post = h.cache.get_query(GetPost(1)).unwrap();
    assert_eq!(post.resolve().await.unwrap(), "post 1 v4");
    assert_eq!(h.origin.calls(), 4);
    assert_eq!(post.state().fetched_count, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_failed_revalidation_keeps_stale_reply() {
    let h = harness(|b| b);
    let mut errors = h.cache.errors();

    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();

    h.origin.failures_left.store(usize::MAX, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(11)).await;
    let err = post.refresh().await.unwrap_err();
    assert_eq!(err.to_string(), "origin unavailable");
    // One initial call plus one attempt and three retries.
    assert_eq!(h.origin.calls(), 5);

    let state = post.state();
    assert!(state.is_failure());
    assert_eq!(state.reply.as_deref(), Some("post 1 v1"));

    let record = errors.recv().await.unwrap();
    assert_eq!(&record.id, post.id());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_concurrent_refreshes_do_not_overlap() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();

    let (a, b, c) = tokio::join!(post.refresh(), post.refresh(), post.refresh());
    assert_eq!(a.unwrap(), "post 1 v2");
    assert_eq!(b.unwrap(), "post 1 v2");
    assert_eq!(c.unwrap(), "post 1 v2");
    assert_eq!(h.origin.calls(), 2);
    assert_eq!(h.origin.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_observers_see_the_same_order() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    let mut first = post.subscribe();
    let mut second = post.clone().subscribe();

    post.resolve().await.unwrap();
    post.refresh().await.unwrap();

    let drain = |rx: &mut tokio::sync::broadcast::Receiver<soil_query::QueryState<String>>| {
        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push((state.status, state.fetch_status, state.reply));
        }
        seen
    };
    let seen = drain(&mut first);
    assert_eq!(seen, drain(&mut second));
    assert!(seen.len() >= 4);
    assert_eq!(seen.last().unwrap().2.as_deref(), Some("post 1 v2"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_key_type_conflict_is_rejected() {
    let h = harness(|b| b);
    let _post = h.cache.get_query(GetPost(1)).unwrap();

    let err = h.cache.get_query(PostTitle(1)).unwrap_err();
    assert!(matches!(err, CacheError::KeyConflict { kind: "query", .. }));
    assert!(h.cache.get_query(PostTitle(2)).is_ok());
}

// ============================================================================
// Actor Lifetime
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_keep_alive_destroys_actor_and_state_is_restored() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    drop(post);

    // Still alive inside the keep-alive window.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.cache.snapshot().await.queries.len(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.cache.snapshot().await.queries.is_empty());
    assert_eq!(h.state_cache.len().await, 1);

    let post = h.cache.get_query(GetPost(1)).unwrap();
    assert_eq!(post.resolve().await.unwrap(), "post 1 v1");
    assert_eq!(h.origin.calls(), 1);
    assert!(h.state_cache.is_empty().await);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_resubscribe_within_keep_alive_keeps_actor() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    drop(post);

    tokio::time::sleep(Duration::from_millis(800)).await;
    let post = h.cache.get_query(GetPost(1)).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.cache.snapshot().await.queries.len(), 1);
    assert!(h.state_cache.is_empty().await);
    assert_eq!(post.state().reply.as_deref(), Some("post 1 v1"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_brief_reattach_restarts_keep_alive() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    drop(post);

    tokio::time::sleep(Duration::from_millis(800)).await;
    // Attach and release without giving the actor a chance to run.
    drop(h.cache.get_query(GetPost(1)).unwrap());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.cache.snapshot().await.queries.len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.cache.snapshot().await.queries.is_empty());
    assert_eq!(h.state_cache.len().await, 1);
    assert_eq!(h.origin.calls(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_reattach_while_state_is_saved_keeps_actor() {
    let slow = Arc::new(SlowStateCache {
        inner: HashMapStateCache::default(),
        delay: Duration::from_millis(200),
    });
    let h = harness(|b| b.state_cache(slow.clone()));
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    drop(post);

    // Keep-alive is over and the save is in progress.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let post = h.cache.get_query(GetPost(1)).unwrap();
    assert_eq!(post.resolve().await.unwrap(), "post 1 v1");
    assert_eq!(h.origin.calls(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.cache.snapshot().await.queries.len(), 1);
    assert!(slow.inner.is_empty().await);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_remove_queries_forgets_cached_states() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    drop(post);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.state_cache.len().await, 1);

    let removed = h.cache.remove_queries(&Filter::namespace("posts")).await.unwrap();
    assert_eq!(removed, 0);
    assert!(h.state_cache.is_empty().await);

    let post = h.cache.get_query(GetPost(1)).unwrap();
    assert_eq!(post.resolve().await.unwrap(), "post 1 v2");
}

// ============================================================================
// Infinite Queries
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_infinite_query_loads_until_exhausted() {
    let h = harness(|b| b);
    let feed = h.cache.get_infinite_query(Feed { pages: 3 }).unwrap();

    let first = feed.resolve().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(feed.next_param(), Some(1));

    assert!(feed.load_next().await.unwrap());
    assert!(feed.load_next().await.unwrap());
    assert!(!feed.load_next().await.unwrap());

    let pages: Vec<u32> = feed.state().reply.unwrap().iter().map(|chunk| chunk.param).collect();
    assert_eq!(pages, vec![0, 1, 2]);
    assert_eq!(h.origin.calls(), 3);

    // A refresh refetches every loaded page from the start.
    let refreshed = feed.refresh().await.unwrap();
    assert_eq!(refreshed.len(), 3);
    assert_eq!(refreshed[0].data, "page 0 v4");
    assert_eq!(h.origin.calls(), 6);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_load_more_past_the_last_page_is_ignored() {
    let h = harness(|b| b);
    let feed = h.cache.get_infinite_query(Feed { pages: 2 }).unwrap();
    feed.resolve().await.unwrap();
    assert!(feed.load_next().await.unwrap());
    assert!(!feed.load_next().await.unwrap());

    let chunks = feed.load_more(2).await.unwrap();
    let pages: Vec<u32> = chunks.iter().map(|chunk| chunk.param).collect();
    assert_eq!(pages, vec![0, 1]);
    assert_eq!(h.origin.calls(), 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_load_more_skipping_a_page_is_ignored() {
    let h = harness(|b| b);
    let feed = h.cache.get_infinite_query(Feed { pages: 3 }).unwrap();
    feed.resolve().await.unwrap();

    let chunks = feed.load_more(2).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(h.origin.calls(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_concurrent_load_next_appends_one_page() {
    let h = harness(|b| b);
    let feed = h.cache.get_infinite_query(Feed { pages: 3 }).unwrap();
    feed.resolve().await.unwrap();

    let (a, b) = tokio::join!(feed.load_next(), feed.load_next());
    assert!(a.unwrap());
    assert!(b.unwrap());

    let pages: Vec<u32> = feed.state().reply.unwrap().iter().map(|chunk| chunk.param).collect();
    assert_eq!(pages, vec![0, 1]);
    assert_eq!(h.origin.calls(), 2);
}

// ============================================================================
// Mutations
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_mutation_invalidates_affected_query() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    let other = h.cache.get_query(GetPost(2)).unwrap();
    post.resolve().await.unwrap();
    other.resolve().await.unwrap();

    let edit = h.cache.get_mutation(EditPost).unwrap();
    let result = edit.mutate((1, "hello".to_string())).await.unwrap();
    assert_eq!(result, "edit 1 hello v3");
    assert_eq!(edit.state().mutated_count, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(post.state().reply.as_deref(), Some("post 1 v4"));
    assert_eq!(other.state().reply.as_deref(), Some("post 2 v2"));
}

// ============================================================================
// Direct Data Access
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_set_query_data_on_live_and_inactive_keys() {
    let h = harness(|b| b);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();

    h.cache
        .set_query_data(&GetPost(1), |current| format!("{} (edited)", current.unwrap()))
        .await
        .unwrap();
    // Commands run in order, so the resolve observes the update.
    assert_eq!(post.resolve().await.unwrap(), "post 1 v1 (edited)");

    h.cache
        .set_query_data(&GetPost(7), |current| {
            assert!(current.is_none());
            "draft".to_string()
        })
        .await
        .unwrap();
    assert_eq!(h.cache.get_query_data(&GetPost(7)).await.as_deref(), Some("draft"));

    let draft = h.cache.get_query(GetPost(7)).unwrap();
    assert_eq!(draft.resolve().await.unwrap(), "draft");
    assert_eq!(h.origin.calls(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_prefetch_fills_the_cache() {
    let h = harness(|b| b);
    h.cache.prefetch_query(GetPost(3)).await.unwrap();
    assert_eq!(h.cache.get_query_data(&GetPost(3)).await.as_deref(), Some("post 3 v1"));

    // The prefetched actor outlives its keep-alive in the state cache.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.cache.get_query_data(&GetPost(3)).await.as_deref(), Some("post 3 v1"));
}

// ============================================================================
// Environment Signals
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_critical_memory_pressure_evicts_idle_actors() {
    let memory = Arc::new(EventSource::<MemoryPressureLevel>::new());
    let h = harness(|b| {
        b.memory_pressure(memory.clone()).query_options(QueryOptions {
            keep_alive_time: Duration::from_secs(60),
            ..query_options()
        })
    });

    let idle = h.cache.get_query(GetPost(1)).unwrap();
    idle.resolve().await.unwrap();
    drop(idle);
    let held = h.cache.get_query(GetPost(2)).unwrap();
    held.resolve().await.unwrap();

    memory.emit(MemoryPressureLevel::Critical);
    settle().await;

    let snapshot = h.cache.snapshot().await;
    assert_eq!(snapshot.queries.len(), 1);
    assert_eq!(&snapshot.queries[0].id, held.id());
    assert!(h.state_cache.is_empty().await);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_zero_sweep_interval_still_handles_signals() {
    let memory = Arc::new(EventSource::<MemoryPressureLevel>::new());
    let h = harness(|b| {
        b.sweep_interval(Duration::ZERO)
            .memory_pressure(memory.clone())
            .query_options(QueryOptions {
                keep_alive_time: Duration::from_secs(60),
                ..query_options()
            })
    });

    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    drop(post);
    tokio::time::sleep(Duration::from_secs(1)).await;

    memory.emit(MemoryPressureLevel::Critical);
    settle().await;
    assert!(h.cache.snapshot().await.queries.is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_low_memory_pressure_spares_recently_used_actors() {
    let memory = Arc::new(EventSource::<MemoryPressureLevel>::new());
    let h = harness(|b| {
        b.memory_pressure(memory.clone()).query_options(QueryOptions {
            keep_alive_time: Duration::from_secs(600),
            ..query_options()
        })
    });

    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    drop(post);

    memory.emit(MemoryPressureLevel::Low);
    settle().await;
    assert_eq!(h.cache.snapshot().await.queries.len(), 1);

    tokio::time::sleep(h.cache.config().idle_eviction_age).await;
    memory.emit(MemoryPressureLevel::Low);
    settle().await;
    assert!(h.cache.snapshot().await.queries.is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_foreground_revalidates_stale_active_queries() {
    let window = Arc::new(EventSource::<WindowVisibilityEvent>::new());
    let h = harness(|b| b.window_visibility(window.clone()));

    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();

    window.emit(WindowVisibilityEvent::Foreground);
    settle().await;
    assert_eq!(h.origin.calls(), 1, "fresh replies are not revalidated");

    tokio::time::sleep(Duration::from_secs(11)).await;
    window.emit(WindowVisibilityEvent::Foreground);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.origin.calls(), 2);
    assert_eq!(post.state().reply.as_deref(), Some("post 1 v2"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_network_restore_resumes_paused_queries() {
    let network = Arc::new(EventSource::<NetworkConnectivityEvent>::new());
    let h = harness(|b| b.network_connectivity(network.clone()));

    network.emit(NetworkConnectivityEvent::Lost);
    settle().await;
    assert!(!h.cache.snapshot().await.online);

    h.origin.offline.store(true, Ordering::SeqCst);
    let post = h.cache.get_query(GetPost(1)).unwrap();
    let err = post.resolve().await.unwrap_err();
    assert!(err.is_network());
    // Retries are halted while offline.
    assert_eq!(h.origin.calls(), 1);
    assert!(post.state().is_paused());

    h.origin.offline.store(false, Ordering::SeqCst);
    network.emit(NetworkConnectivityEvent::Available);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = post.state();
    assert!(state.is_success());
    assert_eq!(state.reply.as_deref(), Some("post 1 v2"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_sweep_revalidates_queries_that_turn_stale() {
    let h = harness(|b| {
        b.sweep_interval(Duration::from_secs(5)).query_options(QueryOptions {
            revalidate_on_stale: true,
            ..query_options()
        })
    });

    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.origin.calls(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.origin.calls(), 2);
    assert_eq!(post.state().reply.as_deref(), Some("post 1 v2"));
}

// ============================================================================
// Subscriptions
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_subscription_publishes_items() {
    let h = harness(|b| b);
    let ticker = h.cache.get_subscription(Ticker).unwrap();
    let mut updates = ticker.watch();

    updates.wait_for(|state| state.reply == Some(3)).await.unwrap();
    assert!(ticker.state().is_success());

    let removed = h.cache.remove_subscriptions(&Filter::namespace("ticker")).await.unwrap();
    assert_eq!(removed, 1);
}

// ============================================================================
// Diagnostics
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_snapshot_lists_live_keys() {
    let h = harness(|b| b);
    let b = h.cache.get_query(GetPost(2)).unwrap();
    let a = h.cache.get_query(GetPost(1)).unwrap();
    let _edit = h.cache.get_mutation(EditPost).unwrap();
    a.resolve().await.unwrap();
    b.resolve().await.unwrap();

    let snapshot = h.cache.snapshot().await;
    assert_eq!(snapshot.queries.len(), 2);
    assert_eq!(&snapshot.queries[0].id, a.id());
    assert_eq!(snapshot.mutations.len(), 1);
    assert!(snapshot.online);

    let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(json["queries"][1]["id"]["tags"][0][1], "2");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_metrics_are_emitted_and_flushed_on_close() {
    let sink = Arc::new(RecordingSink::default());
    let h = harness(|b| b.metrics(sink.clone()));

    let post = h.cache.get_query(GetPost(1)).unwrap();
    post.resolve().await.unwrap();
    h.cache.close().await;

    let metrics = sink.metrics.lock().clone();
    assert!(
        metrics
            .iter()
            .any(|metric| matches!(metric, CacheMetric::Fetch { id, .. } if id == post.id()))
    );
    assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
    assert!(h.cache.snapshot().await.queries.is_empty());
}
