//! Query and infinite-query actors.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{ActorContext, Lifecycle, ManagedActor, StatePublisher, Trigger};
use crate::entry::Entry;
use crate::error::CacheError;
use crate::filter::FilterTarget;
use crate::id::UniqueId;
use crate::key::{InfiniteQueryKey, QueryChunk, QueryChunks, QueryKey};
use crate::metrics::{CacheMetric, Outcome, elapsed_ms};
use crate::options::QueryOptions;
use crate::receiver::Receiver;
use crate::retry::RetryFn;
use crate::state::{FetchStatus, QueryState, QueryStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// A subscriber attached.
    Connect,
    /// Mark stale, then refetch.
    Invalidate,
    /// Refetch if failed, paused, pending or stale.
    Resume,
    /// Background sweep; refetch only if stale.
    Revalidate,
}

pub(crate) type DataUpdate<T> = Box<dyn FnOnce(Option<&T>) -> T + Send>;

pub(crate) enum QueryCommand<T, P> {
    /// `ticket` orders the request against fetch starts: a fetch that started
    /// after the request was issued already satisfies it.
    Fetch {
        mode: FetchMode,
        ticket: u64,
        done: Option<oneshot::Sender<()>>,
    },
    LoadMore {
        param: P,
        done: Option<oneshot::Sender<()>>,
    },
    SetData(DataUpdate<T>),
}

/// What a driver needs to talk to the origin.
pub(crate) struct FetchContext<'a> {
    pub(crate) receiver: &'a Receiver,
    pub(crate) retry: RetryFn<'a>,
}

/// Produces query data for a key. Implemented for plain and infinite queries.
#[async_trait]
pub(crate) trait QueryDriver: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;
    type Param: Clone + Send + Sync + 'static;

    /// Fetch a complete fresh value, given the current one.
    async fn revalidate(
        &self,
        cx: &FetchContext<'_>,
        current: Option<&Self::Data>,
    ) -> Result<Self::Data, CacheError>;

    /// Whether `param` continues `current`. Load-more requests for any other
    /// param are dropped.
    fn continues(&self, current: &Self::Data, param: &Self::Param) -> bool;

    /// Extend `current` with the data for `param`.
    async fn load_more(
        &self,
        cx: &FetchContext<'_>,
        current: &Self::Data,
        param: Self::Param,
    ) -> Result<Self::Data, CacheError>;
}

pub(crate) struct PlainQuery<K>(pub(crate) K);

#[async_trait]
impl<K: QueryKey> QueryDriver for PlainQuery<K> {
    type Data = K::Data;
    type Param = ();

    async fn revalidate(
        &self,
        cx: &FetchContext<'_>,
        _current: Option<&K::Data>,
    ) -> Result<K::Data, CacheError> {
        let key = &self.0;
        let receiver = cx.receiver;
        cx.retry
            .run(move || async move { key.fetch(receiver).await.map_err(CacheError::from) })
            .await
    }

    fn continues(&self, _current: &K::Data, _param: &()) -> bool {
        false
    }

    async fn load_more(
        &self,
        _cx: &FetchContext<'_>,
        current: &K::Data,
        _param: (),
    ) -> Result<K::Data, CacheError> {
        Ok(current.clone())
    }
}

pub(crate) struct InfiniteQuery<K>(pub(crate) K);

impl<K: InfiniteQueryKey> InfiniteQuery<K> {
    async fn fetch_page(
        &self,
        cx: &FetchContext<'_>,
        param: K::Param,
    ) -> Result<K::Data, CacheError> {
        let key = &self.0;
        let receiver = cx.receiver;
        cx.retry
            .run(move || {
                let param = param.clone();
                async move { key.fetch(receiver, param).await.map_err(CacheError::from) }
            })
            .await
    }
}

#[async_trait]
impl<K: InfiniteQueryKey> QueryDriver for InfiniteQuery<K> {
    type Data = QueryChunks<K::Data, K::Param>;
    type Param = K::Param;

    /// Refetch from the first page up to as many pages as are loaded now.
    async fn revalidate(
        &self,
        cx: &FetchContext<'_>,
        current: Option<&Self::Data>,
    ) -> Result<Self::Data, CacheError> {
        let pages = current.map_or(0, Vec::len).max(1);
        let mut chunks = Vec::with_capacity(pages);
        let mut param = self.0.initial_param();
        loop {
            let data = self.fetch_page(cx, param.clone()).await?;
            chunks.push(QueryChunk { data, param });
            if chunks.len() >= pages {
                break;
            }
            match self.0.load_more_param(&chunks) {
                Some(next) => param = next,
                None => break,
            }
        }
        Ok(chunks)
    }

    fn continues(&self, current: &Self::Data, param: &K::Param) -> bool {
        self.0.load_more_param(current).as_ref() == Some(param)
    }

    async fn load_more(
        &self,
        cx: &FetchContext<'_>,
        current: &Self::Data,
        param: K::Param,
    ) -> Result<Self::Data, CacheError> {
        let data = self.fetch_page(cx, param.clone()).await?;
        let mut chunks = current.clone();
        chunks.push(QueryChunk { data, param });
        Ok(chunks)
    }
}

/// Handle to a query actor. Shared by the store and every ref.
pub(crate) struct QueryActor<D: QueryDriver> {
    lifecycle: Lifecycle,
    commands: mpsc::UnboundedSender<QueryCommand<D::Data, D::Param>>,
    state: Arc<StatePublisher<QueryState<D::Data>>>,
    tickets: Arc<AtomicU64>,
    driver: Arc<D>,
    options: QueryOptions,
    cx: ActorContext,
}

impl<D: QueryDriver> QueryActor<D> {
    /// Spawn the command loop. The loop first restores the last cached state
    /// for `id`, falling back to `initial_data`.
    pub(crate) fn spawn(
        id: UniqueId,
        driver: D,
        options: QueryOptions,
        cx: ActorContext,
        initial_data: Option<D::Data>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StatePublisher::new(QueryState::default(), cx.state_capacity));
        let tickets = Arc::new(AtomicU64::new(0));
        let driver = Arc::new(driver);
        let lifecycle = Lifecycle::new(id.clone(), options.keep_alive_time);

        let worker = QueryWorker {
            id,
            driver: driver.clone(),
            state: state.clone(),
            tickets: tickets.clone(),
            options: options.clone(),
            cx: cx.clone(),
            last_fetch: None,
        };
        lifecycle.add_task(tokio::spawn(worker.run(rx, initial_data)));

        QueryActor {
            lifecycle,
            commands,
            state,
            tickets,
            driver,
            options,
            cx,
        }
    }

    pub(crate) fn driver(&self) -> &D {
        &self.driver
    }

    pub(crate) fn state(&self) -> QueryState<D::Data> {
        self.state.current()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<QueryState<D::Data>> {
        self.state.watch()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<QueryState<D::Data>> {
        self.state.subscribe()
    }

    pub(crate) fn fetch(&self, mode: FetchMode, done: Option<oneshot::Sender<()>>) {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst);
        self.send(QueryCommand::Fetch { mode, ticket, done });
    }

    pub(crate) fn load_more(&self, param: D::Param, done: Option<oneshot::Sender<()>>) {
        self.send(QueryCommand::LoadMore { param, done });
    }

    pub(crate) fn set_data(&self, update: DataUpdate<D::Data>) {
        self.send(QueryCommand::SetData(update));
    }

    fn send(&self, command: QueryCommand<D::Data, D::Param>) {
        if self.commands.send(command).is_err() {
            tracing::debug!(id = %self.id(), "query actor closed, command dropped");
        }
    }
}

impl<D: QueryDriver> ManagedActor for QueryActor<D> {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn target(&self) -> FilterTarget {
        let now = Instant::now();
        self.state.inspect(|state| FilterTarget {
            id: self.lifecycle.id().clone(),
            subscribers: self.lifecycle.subscribers(),
            is_stale: state.is_stale(now),
            is_failed: state.is_failure(),
            is_paused: state.is_paused(),
            is_pending: state.is_pending(),
            idle_since: self.lifecycle.idle_since(),
        })
    }

    fn invalidate(&self) {
        self.fetch(FetchMode::Invalidate, None);
    }

    fn resume(&self) {
        self.fetch(FetchMode::Resume, None);
    }

    fn revalidates_on(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Focus => self.options.revalidate_on_focus,
            Trigger::Reconnect => self.options.revalidate_on_reconnect,
        }
    }

    fn revalidation_deadline(&self) -> Option<Instant> {
        if !self.options.revalidate_on_stale || self.lifecycle.subscribers() == 0 {
            return None;
        }
        self.state.inspect(|state| {
            if !state.is_success() || state.is_fetching() {
                None
            } else if state.is_invalidated {
                Some(Instant::now())
            } else {
                state.stale_at
            }
        })
    }

    fn revalidate(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.fetch(FetchMode::Revalidate, Some(tx));
        Some(rx)
    }

    fn persist(&self) -> BoxFuture<'static, ()> {
        let state = self.state.current().with_fetch_status(FetchStatus::Idle);
        let state_cache = self.cx.state_cache.clone();
        let id = self.lifecycle.id().clone();
        let expires_at = Instant::now() + self.options.gc_time;
        Box::pin(async move {
            if state.reply.is_none() && state.error.is_none() {
                return;
            }
            let stale_at = if state.is_invalidated { None } else { state.stale_at };
            if let Err(err) = state_cache.set(&id, Entry::new(state, stale_at, expires_at)).await {
                tracing::warn!(id = %id, error = %err, "failed to save query state");
            }
        })
    }

    fn discard_persisted(&self) -> BoxFuture<'static, ()> {
        let state_cache = self.cx.state_cache.clone();
        let id = self.lifecycle.id().clone();
        Box::pin(async move {
            if let Err(err) = state_cache.remove(std::slice::from_ref(&id)).await {
                tracing::warn!(id = %id, error = %err, "failed to drop saved query state");
            }
        })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Owns the state of one query and runs its commands one at a time.
struct QueryWorker<D: QueryDriver> {
    id: UniqueId,
    driver: Arc<D>,
    state: Arc<StatePublisher<QueryState<D::Data>>>,
    tickets: Arc<AtomicU64>,
    options: QueryOptions,
    cx: ActorContext,
    /// Ticket taken when the last fetch started.
    last_fetch: Option<u64>,
}

impl<D: QueryDriver> QueryWorker<D> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<QueryCommand<D::Data, D::Param>>,
        initial_data: Option<D::Data>,
    ) {
        self.restore(initial_data).await;

        while let Some(command) = commands.recv().await {
            match command {
                QueryCommand::Fetch { mode, ticket, done } => {
                    self.handle_fetch(mode, ticket).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                QueryCommand::LoadMore { param, done } => {
                    self.load_more(param).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                QueryCommand::SetData(update) => self.set_data(update),
            }
        }
        tracing::trace!(id = %self.id, "query command loop finished");
    }

    async fn restore(&mut self, initial_data: Option<D::Data>) {
        match self.cx.state_cache.get(&self.id).await {
            Ok(Some(entry)) => match entry.typed::<QueryState<D::Data>>() {
                Some(state) => {
                    tracing::debug!(id = %self.id, "restored cached query state");
                    self.state.publish(state.with_fetch_status(FetchStatus::Idle));
                    let restored = std::slice::from_ref(&self.id);
                    if let Err(err) = self.cx.state_cache.remove(restored).await {
                        tracing::warn!(
                            id = %self.id,
                            error = %err,
                            "failed to drop restored state"
                        );
                    }
                    return;
                }
                None => {
                    tracing::warn!(id = %self.id, "cached state has a different type, ignoring");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(id = %self.id, error = %err, "failed to read cached query state");
            }
        }

        if let Some(data) = initial_data {
            let now = Instant::now();
            self.state.publish(QueryState::success(data, now, now));
        }
    }

    async fn handle_fetch(&mut self, mode: FetchMode, ticket: u64) {
        if self.last_fetch.is_some_and(|started| started > ticket) {
            tracing::trace!(id = %self.id, ?mode, "request satisfied by a later fetch");
            return;
        }

        let now = Instant::now();
        let wanted = self.state.inspect(|state| match mode {
            FetchMode::Connect => {
                state.is_pending() || (self.options.revalidate_on_mount && state.is_stale(now))
            }
            FetchMode::Invalidate => true,
            FetchMode::Resume => {
                state.is_pending() || state.is_failure() || state.is_paused() || state.is_stale(now)
            }
            FetchMode::Revalidate => state.is_stale(now),
        });
        if !wanted {
            return;
        }
        if mode == FetchMode::Invalidate {
            self.state.publish(self.state.current().invalidated());
        }
        self.fetch().await;
    }

    fn is_halted(&self, err: &CacheError) -> bool {
        (self.options.is_network_error)(err) && self.cx.is_offline()
    }

    async fn fetch(&mut self) {
        self.last_fetch = Some(self.tickets.fetch_add(1, Ordering::SeqCst));
        let base = self.state.current();
        self.state.publish(base.with_fetch_status(FetchStatus::Fetching));
        tracing::debug!(id = %self.id, "fetching query");

        let started = std::time::Instant::now();
        let halt = |err: &CacheError| self.is_halted(err);
        let cx = FetchContext {
            receiver: &self.cx.receiver,
            retry: RetryFn::new(&self.options.retry).with_halt(&halt),
        };
        let result = self.driver.revalidate(&cx, base.reply.as_ref()).await;
        self.settle(&base, result, started);
    }

    async fn load_more(&mut self, param: D::Param) {
        let base = self.state.current();
        let Some(reply) = base.reply.as_ref() else {
            tracing::debug!(id = %self.id, "nothing loaded yet, ignoring load more");
            return;
        };
        if !self.driver.continues(reply, &param) {
            tracing::debug!(id = %self.id, "param is not the next page, ignoring load more");
            return;
        }
        self.state.publish(base.with_fetch_status(FetchStatus::Fetching));
        tracing::debug!(id = %self.id, "loading more");

        let started = std::time::Instant::now();
        let halt = |err: &CacheError| self.is_halted(err);
        let cx = FetchContext {
            receiver: &self.cx.receiver,
            retry: RetryFn::new(&self.options.retry).with_halt(&halt),
        };
        let result = self.driver.load_more(&cx, reply, param).await;
        self.settle(&base, result, started);
    }

    /// Publish the outcome of a fetch that started from `base`.
    fn settle(
        &self,
        base: &QueryState<D::Data>,
        result: Result<D::Data, CacheError>,
        started: std::time::Instant,
    ) {
        let outcome = match result {
            Ok(data) => {
                let now = Instant::now();
                self.state.publish(base.with_reply(data, now, now + self.options.stale_time));
                Outcome::Success
            }
            Err(CacheError::Cancelled) => {
                tracing::debug!(id = %self.id, "fetch cancelled");
                self.state.publish(base.with_fetch_status(FetchStatus::Idle));
                Outcome::Cancelled
            }
            Err(err) => {
                let paused = self.is_halted(&err);
                tracing::warn!(id = %self.id, error = %err, paused, "query fetch failed");
                let record = self.cx.error_record(&self.id, err);
                let fetch_status = if paused { FetchStatus::Paused } else { FetchStatus::Idle };
                self.state.publish(base.with_error(record.clone(), fetch_status));
                if !self.options.suppress_error_relay {
                    self.cx.relay(&record);
                }
                if paused { Outcome::Paused } else { Outcome::Failure }
            }
        };
        self.cx.emit(CacheMetric::Fetch {
            id: self.id.clone(),
            outcome,
            latency_ms: elapsed_ms(started),
        });
    }

    fn set_data(&self, update: DataUpdate<D::Data>) {
        let current = self.state.current();
        let data = update(current.reply.as_ref());
        let now = Instant::now();
        self.state.publish(QueryState {
            reply: Some(data),
            reply_updated_at: Some(now),
            error: None,
            stale_at: Some(now + self.options.stale_time),
            status: QueryStatus::Success,
            is_invalidated: false,
            ..current
        });
    }
}
