//! Per-key workers.
//!
//! Every live key is served by one actor: a command-loop task that owns the
//! key's state and a supervisor task that applies the keep-alive policy. All
//! work for a key flows through the actor's single-consumer command channel,
//! so at most one fetch or mutation runs per key at any time.

pub(crate) mod mutation;
pub(crate) mod query;
pub(crate) mod subscription;

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::caches::StateCache;
use crate::environment::NetworkConnectivityEvent;
use crate::error::CacheError;
use crate::filter::FilterTarget;
use crate::id::UniqueId;
use crate::metrics::{CacheMetric, MetricsSink};
use crate::receiver::Receiver;
use crate::sharing::{ActorSharingStarted, SharingCommand};
use crate::state::ErrorRecord;
use crate::store::ActorStore;

/// Single-writer broadcast of state snapshots.
///
/// `watch` always holds the latest snapshot; `broadcast` carries every
/// snapshot in publication order for observers that must not miss any.
pub(crate) struct StatePublisher<S> {
    latest: watch::Sender<S>,
    events: broadcast::Sender<S>,
}

impl<S: Clone> StatePublisher<S> {
    pub(crate) fn new(initial: S, capacity: usize) -> Self {
        let (latest, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(capacity.max(1));
        StatePublisher { latest, events }
    }

    pub(crate) fn publish(&self, state: S) {
        self.latest.send_replace(state.clone());
        // No receivers is fine.
        let _ = self.events.send(state);
    }

    pub(crate) fn current(&self) -> S {
        self.latest.borrow().clone()
    }

    /// Inspect the latest snapshot without cloning it.
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.latest.borrow())
    }

    pub(crate) fn watch(&self) -> watch::Receiver<S> {
        self.latest.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<S> {
        self.events.subscribe()
    }
}

/// Why a revalidation-on-event is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Focus,
    Reconnect,
}

/// Bookkeeping shared by all actor kinds: id, subscriber count, tasks.
pub(crate) struct Lifecycle {
    id: UniqueId,
    subscribers: watch::Sender<usize>,
    idle_since: Mutex<Option<Instant>>,
    keep_alive: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    pub(crate) fn new(id: UniqueId, keep_alive: Duration) -> Self {
        let (subscribers, _) = watch::channel(0);
        Lifecycle {
            id,
            subscribers,
            idle_since: Mutex::new(Some(Instant::now())),
            keep_alive,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> &UniqueId {
        &self.id
    }

    // The count and `idle_since` change under the same lock, so readers of
    // `idle_since` never see a zero count without an idle instant.
    pub(crate) fn attach(&self) {
        let mut idle_since = self.idle_since.lock();
        self.subscribers.send_modify(|count| *count += 1);
        *idle_since = None;
    }

    pub(crate) fn detach(&self) {
        let mut idle_since = self.idle_since.lock();
        self.subscribers.send_modify(|count| {
            *count = count.saturating_sub(1);
            if *count == 0 {
                *idle_since = Some(Instant::now());
            }
        });
    }

    pub(crate) fn subscribers(&self) -> usize {
        *self.subscribers.borrow()
    }

    pub(crate) fn subscriber_counts(&self) -> watch::Receiver<usize> {
        self.subscribers.subscribe()
    }

    pub(crate) fn idle_since(&self) -> Option<Instant> {
        *self.idle_since.lock()
    }

    pub(crate) fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub(crate) fn add_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn abort(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Environment shared by every actor of one cache.
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub(crate) receiver: Arc<Receiver>,
    pub(crate) state_cache: Arc<dyn StateCache>,
    pub(crate) network: watch::Receiver<NetworkConnectivityEvent>,
    pub(crate) relay: broadcast::Sender<ErrorRecord>,
    pub(crate) metrics: Option<Arc<dyn MetricsSink>>,
    /// Used by mutations to apply query effects.
    pub(crate) queries: Weak<ActorStore>,
    pub(crate) state_capacity: usize,
}

impl ActorContext {
    pub(crate) fn is_offline(&self) -> bool {
        *self.network.borrow() == NetworkConnectivityEvent::Lost
    }

    pub(crate) fn emit(&self, metric: CacheMetric) {
        if let Some(metrics) = &self.metrics {
            metrics.emit(metric);
        }
    }

    /// Forward a failure to error relay listeners.
    pub(crate) fn relay(&self, record: &ErrorRecord) {
        let _ = self.relay.send(record.clone());
    }

    pub(crate) fn error_record(&self, id: &UniqueId, error: CacheError) -> ErrorRecord {
        ErrorRecord {
            id: id.clone(),
            error,
            at: Instant::now(),
        }
    }
}

/// Type-erased view of an actor used by stores and the cache facade.
pub(crate) trait ManagedActor: Send + Sync + 'static {
    fn lifecycle(&self) -> &Lifecycle;

    fn target(&self) -> FilterTarget;

    fn invalidate(&self);

    fn resume(&self);

    /// Whether the actor wants to be resumed for the given event.
    fn revalidates_on(&self, trigger: Trigger) -> bool;

    /// Stale deadline for background revalidation, if the actor takes part in it.
    fn revalidation_deadline(&self) -> Option<Instant> {
        None
    }

    /// Ask for a revalidation. The receiver resolves once it was handled.
    fn revalidate(&self) -> Option<tokio::sync::oneshot::Receiver<()>> {
        None
    }

    /// Write the current state to the inactive-state cache.
    fn persist(&self) -> futures::future::BoxFuture<'static, ()>;

    /// Drop what [`persist`](Self::persist) wrote, for an actor that turned
    /// out to stay alive.
    fn discard_persisted(&self) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn id(&self) -> &UniqueId {
        self.lifecycle().id()
    }

    fn subscribers(&self) -> usize {
        self.lifecycle().subscribers()
    }

    fn shutdown(&self) {
        self.lifecycle().abort();
    }
}

/// Apply the keep-alive policy to one actor until it is removed.
///
/// Holds weak references only: dropping the store or the actor ends the task.
pub(crate) async fn supervise(
    store: Weak<ActorStore>,
    actor: Weak<dyn ManagedActor>,
    keep_alive: Duration,
) {
    let Some(mut counts) = actor.upgrade().map(|actor| actor.lifecycle().subscriber_counts())
    else {
        return;
    };
    let mut sharing = ActorSharingStarted::started(keep_alive);

    while let Some(command) = sharing.next(&mut counts).await {
        let (Some(store), Some(actor)) = (store.upgrade(), actor.upgrade()) else {
            return;
        };
        match command {
            SharingCommand::Start => {
                tracing::trace!(id = %actor.id(), "actor active");
            }
            SharingCommand::Stop => {
                // `None` means a subscriber is back; the policy sees it next.
                let Some(since) = actor.lifecycle().idle_since() else {
                    continue;
                };
                if since + keep_alive > Instant::now() {
                    sharing.hold_until(since + keep_alive);
                    continue;
                }
                if !store.is_registered(&actor) {
                    actor.shutdown();
                    return;
                }
                // The state is saved while the actor is still registered, so a
                // caller arriving meanwhile either reattaches or finds the entry.
                actor.persist().await;
                if store.remove_if_idle(&actor, since) {
                    tracing::debug!(id = %actor.id(), "actor idle past keep-alive, destroying");
                    actor.shutdown();
                    return;
                }
                tracing::trace!(id = %actor.id(), "actor reattached while saving its state");
                actor.discard_persisted().await;
                if let Some(since) = actor.lifecycle().idle_since() {
                    sharing.hold_until(since + keep_alive);
                }
            }
        }
    }
}

#[cfg(test)]
impl ActorContext {
    /// A context with an in-memory state cache and no query store.
    pub(crate) fn for_tests() -> (Self, watch::Sender<NetworkConnectivityEvent>) {
        let (network_tx, network) = watch::channel(NetworkConnectivityEvent::Available);
        let (relay, _) = broadcast::channel(16);
        let cx = ActorContext {
            receiver: Arc::new(Receiver::default()),
            state_cache: Arc::new(crate::caches::HashMapStateCache::default()),
            network,
            relay,
            metrics: None,
            queries: Weak::new(),
            state_capacity: 64,
        };
        (cx, network_tx)
    }
}
