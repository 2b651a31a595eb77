use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use super::{ActorContext, Lifecycle, ManagedActor, StatePublisher, Trigger};
use crate::entry::Entry;
use crate::error::{BoxError, CacheError};
use crate::filter::FilterTarget;
use crate::id::UniqueId;
use crate::key::SubscriptionKey;
use crate::options::SubscriptionOptions;
use crate::state::{SubscriptionState, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionCommand {
    Connect,
    Resume,
    Reset,
}

type ItemStream<T> = BoxStream<'static, Result<T, BoxError>>;

pub(crate) struct SubscriptionActor<K: SubscriptionKey> {
    lifecycle: Lifecycle,
    commands: mpsc::UnboundedSender<SubscriptionCommand>,
    state: Arc<StatePublisher<SubscriptionState<K::Data>>>,
    options: SubscriptionOptions,
    cx: ActorContext,
}

impl<K: SubscriptionKey> SubscriptionActor<K> {
    pub(crate) fn spawn(
        id: UniqueId,
        key: K,
        options: SubscriptionOptions,
        cx: ActorContext,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StatePublisher::new(SubscriptionState::default(), cx.state_capacity));
        let lifecycle = Lifecycle::new(id.clone(), options.keep_alive_time);

        let worker = SubscriptionWorker {
            id,
            key,
            state: state.clone(),
            options: options.clone(),
            cx: cx.clone(),
            stream: None,
            retry_at: None,
            attempt: 0,
        };
        lifecycle.add_task(tokio::spawn(worker.run(rx)));

        SubscriptionActor {
            lifecycle,
            commands,
            state,
            options,
            cx,
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState<K::Data> {
        self.state.current()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SubscriptionState<K::Data>> {
        self.state.watch()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SubscriptionState<K::Data>> {
        self.state.subscribe()
    }

    pub(crate) fn send(&self, command: SubscriptionCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(
                id = %self.id(),
                ?command,
                "subscription actor closed, command dropped"
            );
        }
    }
}

impl<K: SubscriptionKey> ManagedActor for SubscriptionActor<K> {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn target(&self) -> FilterTarget {
        self.state.inspect(|state| FilterTarget {
            id: self.lifecycle.id().clone(),
            subscribers: self.lifecycle.subscribers(),
            is_stale: false,
            is_failed: state.is_failure(),
            is_paused: false,
            is_pending: state.is_pending(),
            idle_since: self.lifecycle.idle_since(),
        })
    }

    fn invalidate(&self) {
        self.send(SubscriptionCommand::Reset);
    }

    fn resume(&self) {
        self.send(SubscriptionCommand::Resume);
    }

    fn revalidates_on(&self, trigger: Trigger) -> bool {
        trigger == Trigger::Reconnect && self.options.revalidate_on_reconnect
    }

    fn persist(&self) -> BoxFuture<'static, ()> {
        let state = self.state.current();
        let state_cache = self.cx.state_cache.clone();
        let id = self.lifecycle.id().clone();
        let expires_at = Instant::now() + self.options.gc_time;
        Box::pin(async move {
            if state.reply.is_none() {
                return;
            }
            // A subscription reply is never fresh once the stream is closed.
            if let Err(err) = state_cache.set(&id, Entry::new(state, None, expires_at)).await {
                tracing::warn!(id = %id, error = %err, "failed to save subscription state");
            }
        })
    }

    fn discard_persisted(&self) -> BoxFuture<'static, ()> {
        let state_cache = self.cx.state_cache.clone();
        let id = self.lifecycle.id().clone();
        Box::pin(async move {
            if let Err(err) = state_cache.remove(std::slice::from_ref(&id)).await {
                tracing::warn!(id = %id, error = %err, "failed to drop saved subscription state");
            }
        })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct SubscriptionWorker<K: SubscriptionKey> {
    id: UniqueId,
    key: K,
    state: Arc<StatePublisher<SubscriptionState<K::Data>>>,
    options: SubscriptionOptions,
    cx: ActorContext,
    stream: Option<ItemStream<K::Data>>,
    /// When the next reconnect attempt is due.
    retry_at: Option<Instant>,
    /// Consecutive failed attempts since the last item.
    attempt: usize,
}

async fn next_item<T>(stream: &mut Option<ItemStream<T>>) -> Option<Result<T, BoxError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<K: SubscriptionKey> SubscriptionWorker<K> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SubscriptionCommand>) {
        self.restore().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                item = next_item(&mut self.stream) => self.on_item(item),
                () = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.open();
                }
            }
        }
        tracing::trace!(id = %self.id, "subscription command loop finished");
    }

    async fn restore(&mut self) {
        match self.cx.state_cache.get(&self.id).await {
            Ok(Some(entry)) => {
                if let Some(state) = entry.typed::<SubscriptionState<K::Data>>() {
                    tracing::debug!(id = %self.id, "restored cached subscription state");
                    self.state.publish(state);
                    let restored = std::slice::from_ref(&self.id);
                    if let Err(err) = self.cx.state_cache.remove(restored).await {
                        tracing::warn!(
                            id = %self.id,
                            error = %err,
                            "failed to drop restored state"
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    id = %self.id,
                    error = %err,
                    "failed to read cached subscription state"
                );
            }
        }
    }

    fn handle(&mut self, command: SubscriptionCommand) {
        tracing::trace!(id = %self.id, ?command, "subscription command");
        match command {
            SubscriptionCommand::Connect => {
                let failed = self.state.inspect(|state| state.is_failure());
                if self.stream.is_none() && self.retry_at.is_none() && !failed {
                    self.open();
                }
            }
            SubscriptionCommand::Resume => {
                if self.stream.is_none() {
                    self.attempt = 0;
                    self.retry_at = None;
                    self.open();
                }
            }
            SubscriptionCommand::Reset => {
                self.stream = None;
                self.attempt = 0;
                self.retry_at = None;
                let current = self.state.current();
                let status = if current.reply.is_some() {
                    SubscriptionStatus::Success
                } else {
                    SubscriptionStatus::Pending
                };
                self.state.publish(SubscriptionState {
                    error: None,
                    status,
                    restarted_at: Some(Instant::now()),
                    ..current
                });
                self.open();
            }
        }
    }

    fn open(&mut self) {
        tracing::debug!(id = %self.id, attempt = self.attempt, "opening subscription stream");
        self.stream = Some(self.key.subscribe(&self.cx.receiver));
    }

    fn on_item(&mut self, item: Option<Result<K::Data, BoxError>>) {
        match item {
            Some(Ok(data)) => {
                self.attempt = 0;
                let current = self.state.current();
                self.state.publish(SubscriptionState {
                    reply: Some(data),
                    reply_updated_at: Some(Instant::now()),
                    error: None,
                    status: SubscriptionStatus::Success,
                    ..current
                });
            }
            Some(Err(err)) => {
                self.stream = None;
                self.on_error(CacheError::from(err));
            }
            None => {
                tracing::debug!(id = %self.id, "subscription stream completed");
                self.stream = None;
            }
        }
    }

    fn on_error(&mut self, err: CacheError) {
        if err.is_cancelled() {
            return;
        }
        let halted = (self.options.is_network_error)(&err) && self.cx.is_offline();
        let retry = &self.options.retry;
        if !halted && self.attempt < retry.retry_count && (retry.should_retry)(&err) {
            let delay = retry.backoff(self.attempt);
            self.attempt += 1;
            tracing::debug!(
                id = %self.id,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "resubscribing after failure"
            );
            self.retry_at = Some(Instant::now() + delay);
            return;
        }

        tracing::warn!(id = %self.id, error = %err, halted, "subscription failed");
        let record = self.cx.error_record(&self.id, err);
        let current = self.state.current();
        self.state.publish(SubscriptionState {
            error_updated_at: Some(record.at),
            error: Some(record.clone()),
            status: SubscriptionStatus::Failure,
            ..current
        });
        if !self.options.suppress_error_relay {
            self.cx.relay(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Receiver;
    use crate::retry::{FixedRandomizer, RetryOptions};
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Emits `items` on every open, then fails when `fail` is set.
    struct Ticker {
        opens: Arc<AtomicUsize>,
        items: Vec<u32>,
        fail: bool,
    }

    impl SubscriptionKey for Ticker {
        type Data = u32;

        fn id(&self) -> UniqueId {
            UniqueId::subscription("ticker")
        }

        fn subscribe(&self, _receiver: &Receiver) -> BoxStream<'static, Result<u32, BoxError>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let items = self.items.clone().into_iter().map(Ok);
            let tail: Vec<Result<u32, BoxError>> = if self.fail {
                vec![Err(CacheError::failed("socket closed").into())]
            } else {
                Vec::new()
            };
            stream::iter(items.chain(tail)).boxed()
        }
    }

    fn spawn(items: Vec<u32>, fail: bool) -> (SubscriptionActor<Ticker>, Arc<AtomicUsize>) {
        let (cx, _network) = ActorContext::for_tests();
        let opens = Arc::new(AtomicUsize::new(0));
        let key = Ticker {
            opens: opens.clone(),
            items,
            fail,
        };
        let options = SubscriptionOptions {
            retry: RetryOptions {
                retry_count: 2,
                randomizer: Arc::new(FixedRandomizer(0.5)),
                ..Default::default()
            },
            ..Default::default()
        };
        (SubscriptionActor::spawn(key.id(), key, options, cx), opens)
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_become_success() {
        let (actor, opens) = spawn(vec![1, 2, 3], false);
        actor.send(SubscriptionCommand::Connect);

        let mut watch = actor.watch();
        let state = watch.wait_for(|s| s.reply == Some(3)).await.unwrap().clone();
        assert!(state.is_success());
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_errors_are_retried_then_fail() {
        let (actor, opens) = spawn(Vec::new(), true);
        actor.send(SubscriptionCommand::Connect);

        let mut watch = actor.watch();
        let state = watch.wait_for(|s| s.is_failure()).await.unwrap().clone();
        assert!(state.error.is_some());
        assert_eq!(opens.load(Ordering::SeqCst), 3);

        // Stays failed until resumed.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 3);

        actor.send(SubscriptionCommand::Resume);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_stream() {
        let (actor, opens) = spawn(vec![7], false);
        actor.send(SubscriptionCommand::Connect);
        let mut watch = actor.watch();
        watch.wait_for(|s| s.reply == Some(7)).await.unwrap();

        actor.send(SubscriptionCommand::Reset);
        let state = watch.wait_for(|s| s.restarted_at.is_some()).await.unwrap().clone();
        assert_eq!(state.reply, Some(7));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }
}
