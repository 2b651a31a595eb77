use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{ActorContext, Lifecycle, ManagedActor, StatePublisher, Trigger};
use crate::caches::remove_matching;
use crate::error::CacheError;
use crate::filter::FilterTarget;
use crate::id::UniqueId;
use crate::key::{MutationKey, QueryEffect};
use crate::metrics::{CacheMetric, Outcome, elapsed_ms};
use crate::options::MutationOptions;
use crate::retry::RetryFn;
use crate::state::{MutationState, MutationStatus};

pub(crate) type MutationReply<T> = oneshot::Sender<Result<T, CacheError>>;

pub(crate) enum MutationCommand<V, T> {
    Mutate {
        variable: V,
        reply: Option<MutationReply<T>>,
    },
    Reset,
}

pub(crate) struct MutationActor<K: MutationKey> {
    lifecycle: Lifecycle,
    commands: mpsc::UnboundedSender<MutationCommand<K::Variable, K::Data>>,
    state: Arc<StatePublisher<MutationState<K::Data>>>,
}

impl<K: MutationKey> MutationActor<K> {
    pub(crate) fn spawn(id: UniqueId, key: K, options: MutationOptions, cx: ActorContext) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StatePublisher::new(MutationState::default(), cx.state_capacity));
        let lifecycle = Lifecycle::new(id.clone(), options.keep_alive_time);

        let worker = MutationWorker {
            id,
            key,
            state: state.clone(),
            options,
            cx,
        };
        lifecycle.add_task(tokio::spawn(worker.run(rx)));

        MutationActor {
            lifecycle,
            commands,
            state,
        }
    }

    pub(crate) fn state(&self) -> MutationState<K::Data> {
        self.state.current()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<MutationState<K::Data>> {
        self.state.watch()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<MutationState<K::Data>> {
        self.state.subscribe()
    }

    pub(crate) fn mutate(&self, variable: K::Variable, reply: Option<MutationReply<K::Data>>) {
        self.send(MutationCommand::Mutate { variable, reply });
    }

    pub(crate) fn reset(&self) {
        self.send(MutationCommand::Reset);
    }

    fn send(&self, command: MutationCommand<K::Variable, K::Data>) {
        if self.commands.send(command).is_err() {
            tracing::debug!(id = %self.id(), "mutation actor closed, command dropped");
        }
    }
}

impl<K: MutationKey> ManagedActor for MutationActor<K> {
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

    // Mutations only run when submitted.
    fn invalidate(&self) {}

    fn resume(&self) {}

    fn revalidates_on(&self, _trigger: Trigger) -> bool {
        false
    }

    fn persist(&self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct MutationWorker<K: MutationKey> {
    id: UniqueId,
    key: K,
    state: Arc<StatePublisher<MutationState<K::Data>>>,
    options: MutationOptions,
    cx: ActorContext,
}

impl<K: MutationKey> MutationWorker<K> {
    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<MutationCommand<K::Variable, K::Data>>,
    ) {
        while let Some(command) = commands.recv().await {
            match command {
                MutationCommand::Mutate { variable, reply } => {
                    let result = self.mutate(variable).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                MutationCommand::Reset => {
                    tracing::debug!(id = %self.id, "mutation reset");
                    self.state.publish(MutationState::default());
                }
            }
        }
    }

    async fn mutate(&self, variable: K::Variable) -> Result<K::Data, CacheError> {
        let base = self.state.current();
        if self.options.is_one_shot && base.is_success() {
            return Err(CacheError::AlreadyMutated(self.id.to_string()));
        }

        self.state.publish(MutationState {
            status: MutationStatus::Pending,
            submitted_at: Some(Instant::now()),
            ..base.clone()
        });
        tracing::debug!(id = %self.id, "mutating");

        let started = std::time::Instant::now();
        let key = &self.key;
        let receiver = &*self.cx.receiver;
        let result = RetryFn::new(&self.options.retry)
            .run(|| {
                let variable = variable.clone();
                async move { key.mutate(receiver, variable).await.map_err(CacheError::from) }
            })
            .await;

        let outcome = match &result {
            Ok(data) => {
                let now = Instant::now();
                self.state.publish(MutationState {
                    reply: Some(data.clone()),
                    reply_updated_at: Some(now),
                    error: None,
                    status: MutationStatus::Success,
                    mutated_count: base.mutated_count + 1,
                    submitted_at: Some(now),
                    ..base
                });
                self.apply_effects(self.key.on_query_update(&variable, data)).await;
                Outcome::Success
            }
            Err(CacheError::Cancelled) => {
                self.state.publish(base);
                Outcome::Cancelled
            }
            Err(err) => {
                tracing::warn!(id = %self.id, error = %err, "mutation failed");
                let record = self.cx.error_record(&self.id, err.clone());
                self.state.publish(MutationState {
                    error_updated_at: Some(record.at),
                    error: Some(record.clone()),
                    status: MutationStatus::Failure,
                    ..base
                });
                if !self.options.suppress_error_relay {
                    self.cx.relay(&record);
                }
                Outcome::Failure
            }
        };
        self.cx.emit(CacheMetric::Mutate {
            id: self.id.clone(),
            outcome,
            latency_ms: elapsed_ms(started),
        });
        result
    }

    async fn apply_effects(&self, effects: Vec<QueryEffect>) {
        if effects.is_empty() {
            return;
        }
        let Some(queries) = self.cx.queries.upgrade() else {
            return;
        };
        for effect in effects {
            match effect {
                QueryEffect::Invalidate(filter) => {
                    let count = queries.invalidate_by(&filter);
                    tracing::debug!(id = %self.id, count, "mutation invalidated queries");
                }
                QueryEffect::Resume(filter) => {
                    queries.resume_by(&filter);
                }
                QueryEffect::Remove(filter) => {
                    queries.remove_by(&filter);
                    if let Err(err) = remove_matching(self.cx.state_cache.as_ref(), &filter).await {
                        tracing::warn!(
                            id = %self.id,
                            error = %err,
                            "failed to remove cached query states"
                        );
                    }
                }
            }
        }
    }
}
