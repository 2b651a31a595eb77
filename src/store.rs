//! Registry of live actors, one per id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::actor::{ManagedActor, Trigger, supervise};
use crate::error::CacheError;
use crate::filter::{Filter, FilterTarget};
use crate::id::{KeyKind, UniqueId};
use crate::metrics::{CacheMetric, EvictReason, MetricsSink};

/// Holds the live actors of one kind family (queries, mutations or subscriptions).
///
/// Creation and removal happen under one lock, so concurrent callers asking
/// for the same id always share a single actor.
pub(crate) struct ActorStore {
    kind: &'static str,
    actors: Mutex<HashMap<UniqueId, Arc<dyn ManagedActor>>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ActorStore {
    pub(crate) fn new(kind: &'static str, metrics: Option<Arc<dyn MetricsSink>>) -> Self {
        ActorStore {
            kind,
            actors: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Return the actor for `id`, creating it with `create` if there is none.
    ///
    /// The returned actor already counts the caller as a subscriber.
    pub(crate) fn get_or_create<A, F>(
        self: &Arc<Self>,
        id: &UniqueId,
        create: F,
    ) -> Result<Arc<A>, CacheError>
    where
        A: ManagedActor,
        F: FnOnce() -> A,
    {
        let mut actors = self.actors.lock();
        if let Some(existing) = actors.get(id) {
            let actor = existing.clone().into_any().downcast::<A>().map_err(|_| {
                CacheError::KeyConflict {
                    id: id.to_string(),
                    kind: self.kind,
                }
            })?;
            actor.lifecycle().attach();
            return Ok(actor);
        }

        let actor = Arc::new(create());
        actor.lifecycle().attach();
        let managed: Arc<dyn ManagedActor> = actor.clone();
        actors.insert(id.clone(), managed.clone());
        drop(actors);

        tracing::debug!(id = %id, kind = self.kind, "actor created");
        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(self),
            Arc::downgrade(&managed),
            actor.lifecycle().keep_alive(),
        ));
        actor.lifecycle().add_task(supervisor);
        Ok(actor)
    }

    /// Look up a live actor without subscribing to it.
    pub(crate) fn find<A: ManagedActor>(&self, id: &UniqueId) -> Option<Arc<A>> {
        let existing = self.actors.lock().get(id).cloned()?;
        existing.into_any().downcast::<A>().ok()
    }

    /// Whether `actor` is the registered actor for its id.
    pub(crate) fn is_registered(&self, actor: &Arc<dyn ManagedActor>) -> bool {
        self.actors
            .lock()
            .get(actor.id())
            .is_some_and(|current| Arc::ptr_eq(current, actor))
    }

    /// Remove `actor` if it is still the registered actor for its id and has
    /// been idle since `idle_since` without interruption.
    pub(crate) fn remove_if_idle(
        &self,
        actor: &Arc<dyn ManagedActor>,
        idle_since: Instant,
    ) -> bool {
        let mut actors = self.actors.lock();
        let registered = actors.get(actor.id()).is_some_and(|current| Arc::ptr_eq(current, actor));
        if !registered || actor.lifecycle().idle_since() != Some(idle_since) {
            return false;
        }
        actors.remove(actor.id());
        drop(actors);
        self.emit_evict(actor.id().kind(), 1, EvictReason::KeepAlive);
        true
    }

    /// Remove every actor matching `filter`. Returns the removed ids.
    ///
    /// Idle actors are shut down right away. Actors that still have
    /// subscribers keep serving them until the last one leaves.
    pub(crate) fn remove_by(&self, filter: &Filter) -> Vec<UniqueId> {
        let removed: Vec<Arc<dyn ManagedActor>> = {
            let mut actors = self.actors.lock();
            let ids: Vec<UniqueId> = actors
                .iter()
                .filter(|(_, actor)| filter.matches(&actor.target()))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| actors.remove(id)).collect()
        };
        for actor in &removed {
            if actor.subscribers() == 0 {
                actor.shutdown();
            }
        }
        if let Some(first) = removed.first() {
            self.emit_evict(first.id().kind(), removed.len(), EvictReason::Removed);
        }
        removed.iter().map(|actor| actor.id().clone()).collect()
    }

    pub(crate) fn invalidate_by(&self, filter: &Filter) -> usize {
        let matching = self.matching(filter);
        for actor in &matching {
            actor.invalidate();
        }
        matching.len()
    }

    pub(crate) fn resume_by(&self, filter: &Filter) -> usize {
        let matching = self.matching(filter);
        for actor in &matching {
            actor.resume();
        }
        matching.len()
    }

    /// Resume actors matching `filter` that opted into revalidation on `trigger`.
    pub(crate) fn resume_on(&self, filter: &Filter, trigger: Trigger) -> usize {
        let matching: Vec<_> = self
            .matching(filter)
            .into_iter()
            .filter(|actor| actor.revalidates_on(trigger))
            .collect();
        for actor in &matching {
            actor.resume();
        }
        matching.len()
    }

    /// Destroy actors without subscribers that have been idle for at least `min_idle`.
    pub(crate) fn evict_idle(&self, min_idle: Duration) -> usize {
        let now = Instant::now();
        let evicted: Vec<Arc<dyn ManagedActor>> = {
            let mut actors = self.actors.lock();
            let ids: Vec<UniqueId> = actors
                .iter()
                .filter(|(_, actor)| {
                    actor.subscribers() == 0
                        && actor
                            .lifecycle()
                            .idle_since()
                            .is_some_and(|since| now.saturating_duration_since(since) >= min_idle)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| actors.remove(id)).collect()
        };
        for actor in &evicted {
            actor.shutdown();
        }
        if let Some(first) = evicted.first() {
            tracing::debug!(kind = self.kind, count = evicted.len(), "evicted idle actors");
            self.emit_evict(first.id().kind(), evicted.len(), EvictReason::MemoryPressure);
        }
        evicted.len()
    }

    /// Shut down and forget every actor.
    pub(crate) fn clear(&self) {
        let actors: Vec<_> = self.actors.lock().drain().map(|(_, actor)| actor).collect();
        for actor in actors {
            actor.shutdown();
        }
    }

    pub(crate) fn actors(&self) -> Vec<Arc<dyn ManagedActor>> {
        self.actors.lock().values().cloned().collect()
    }

    pub(crate) fn targets(&self) -> Vec<FilterTarget> {
        self.actors().iter().map(|actor| actor.target()).collect()
    }

    fn matching(&self, filter: &Filter) -> Vec<Arc<dyn ManagedActor>> {
        self.actors()
            .into_iter()
            .filter(|actor| filter.matches(&actor.target()))
            .collect()
    }

    fn emit_evict(&self, kind: KeyKind, count: usize, reason: EvictReason) {
        if let Some(metrics) = &self.metrics {
            metrics.emit(CacheMetric::Evict { kind, count, reason });
        }
    }
}

#[cfg(test)]
impl ActorStore {
    fn get(&self, id: &UniqueId) -> Option<Arc<dyn ManagedActor>> {
        self.actors.lock().get(id).cloned()
    }

    fn len(&self) -> usize {
        self.actors.lock().len()
    }

    fn ids(&self) -> Vec<UniqueId> {
        self.actors.lock().keys().cloned().collect()
    }
}
