//! Handles returned by [`SwrCache`](crate::SwrCache) to observe and drive keys.
//!
//! Every ref counts as one subscriber of its actor. Cloning a ref adds a
//! subscriber; dropping or closing it removes one. Once the last ref is gone
//! the actor is destroyed after its keep-alive time.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};

use crate::actor::ManagedActor;
use crate::actor::mutation::MutationActor;
use crate::actor::query::{FetchMode, InfiniteQuery, PlainQuery, QueryActor, QueryDriver};
use crate::actor::subscription::{SubscriptionActor, SubscriptionCommand};
use crate::error::CacheError;
use crate::id::UniqueId;
use crate::key::{InfiniteQueryKey, MutationKey, QueryChunks, QueryKey, SubscriptionKey};
use crate::state::{MutationState, QueryState, QueryStatus, SubscriptionState};

/// One subscription on an actor.
struct Attached<A: ManagedActor>(Arc<A>);

impl<A: ManagedActor> Clone for Attached<A> {
    fn clone(&self) -> Self {
        self.0.lifecycle().attach();
        Attached(self.0.clone())
    }
}

impl<A: ManagedActor> Drop for Attached<A> {
    fn drop(&mut self) {
        self.0.lifecycle().detach();
    }
}

impl<A: ManagedActor> Deref for Attached<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.0
    }
}

/// Send a fetch request and wait until the actor handled it.
async fn request<D: QueryDriver>(
    actor: &QueryActor<D>,
    mode: FetchMode,
) -> Result<D::Data, CacheError> {
    let (tx, rx) = oneshot::channel();
    actor.fetch(mode, Some(tx));
    rx.await.map_err(|_| CacheError::Closed(actor.id().to_string()))?;
    reply_of(actor.id(), &actor.state())
}

fn reply_of<T: Clone>(id: &UniqueId, state: &QueryState<T>) -> Result<T, CacheError> {
    let not_loaded = || CacheError::NotLoaded(id.to_string());
    match state.status {
        QueryStatus::Success => state.reply.clone().ok_or_else(not_loaded),
        QueryStatus::Failure => Err(state
            .error
            .as_ref()
            .map_or_else(not_loaded, |record| record.error.clone())),
        QueryStatus::Pending => Err(not_loaded()),
    }
}

/// Handle to a query.
pub struct QueryRef<K: QueryKey> {
    actor: Attached<QueryActor<PlainQuery<K>>>,
}

impl<K: QueryKey> QueryRef<K> {
    /// Wrap an actor whose subscriber count already includes this ref.
    pub(crate) fn connect(actor: Arc<QueryActor<PlainQuery<K>>>) -> Self {
        actor.fetch(FetchMode::Connect, None);
        QueryRef {
            actor: Attached(actor),
        }
    }

    pub fn id(&self) -> &UniqueId {
        self.actor.id()
    }

    pub fn key(&self) -> &K {
        &self.actor.driver().0
    }

    /// The latest state.
    pub fn state(&self) -> QueryState<K::Data> {
        self.actor.state()
    }

    /// Watch the latest state. Intermediate states may be skipped.
    pub fn watch(&self) -> watch::Receiver<QueryState<K::Data>> {
        self.actor.watch()
    }

    /// Receive every state published from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryState<K::Data>> {
        self.actor.subscribe()
    }

    /// Mark the reply stale and refetch.
    pub fn invalidate(&self) {
        self.actor.invalidate();
    }

    /// Refetch if the query failed, is paused or holds stale data.
    pub fn resume(&self) {
        self.actor.resume();
    }

    /// The current reply, fetching first if it is missing, stale or failed.
    pub async fn resolve(&self) -> Result<K::Data, CacheError> {
        request(&self.actor, FetchMode::Resume).await
    }

    /// Invalidate and wait for the refetch.
    pub async fn refresh(&self) -> Result<K::Data, CacheError> {
        request(&self.actor, FetchMode::Invalidate).await
    }

    /// Stop observing. Same as dropping the ref.
    pub fn close(self) {}
}

impl<K: QueryKey> Clone for QueryRef<K> {
    fn clone(&self) -> Self {
        QueryRef {
            actor: self.actor.clone(),
        }
    }
}

impl<K: QueryKey> fmt::Debug for QueryRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRef").field("id", self.id()).finish()
    }
}

/// Handle to a paginated query.
pub struct InfiniteQueryRef<K: InfiniteQueryKey> {
    actor: Attached<QueryActor<InfiniteQuery<K>>>,
}

impl<K: InfiniteQueryKey> InfiniteQueryRef<K> {
    pub(crate) fn connect(actor: Arc<QueryActor<InfiniteQuery<K>>>) -> Self {
        actor.fetch(FetchMode::Connect, None);
        InfiniteQueryRef {
            actor: Attached(actor),
        }
    }

    pub fn id(&self) -> &UniqueId {
        self.actor.id()
    }

    pub fn key(&self) -> &K {
        &self.actor.driver().0
    }

    pub fn state(&self) -> QueryState<QueryChunks<K::Data, K::Param>> {
        self.actor.state()
    }

    pub fn watch(&self) -> watch::Receiver<QueryState<QueryChunks<K::Data, K::Param>>> {
        self.actor.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryState<QueryChunks<K::Data, K::Param>>> {
        self.actor.subscribe()
    }

    /// Refetch every loaded page, starting over from the initial param.
    pub fn invalidate(&self) {
        self.actor.invalidate();
    }

    pub fn resume(&self) {
        self.actor.resume();
    }

    pub async fn resolve(&self) -> Result<QueryChunks<K::Data, K::Param>, CacheError> {
        request(&self.actor, FetchMode::Resume).await
    }

    pub async fn refresh(&self) -> Result<QueryChunks<K::Data, K::Param>, CacheError> {
        request(&self.actor, FetchMode::Invalidate).await
    }

    /// Param of the next page, or `None` when nothing is loaded yet or every page is.
    pub fn next_param(&self) -> Option<K::Param> {
        let state = self.actor.state();
        state.reply.as_ref().and_then(|chunks| self.key().load_more_param(chunks))
    }

    /// Fetch the page for `param` and append it.
    pub async fn load_more(
        &self,
        param: K::Param,
    ) -> Result<QueryChunks<K::Data, K::Param>, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.actor.load_more(param, Some(tx));
        rx.await.map_err(|_| CacheError::Closed(self.id().to_string()))?;
        reply_of(self.id(), &self.actor.state())
    }

    /// Load the page after the last one. Returns `false` once there is nothing more to load.
    pub async fn load_next(&self) -> Result<bool, CacheError> {
        match self.next_param() {
            Some(param) => self.load_more(param).await.map(|_| true),
            None => Ok(false),
        }
    }

    pub fn close(self) {}
}

impl<K: InfiniteQueryKey> Clone for InfiniteQueryRef<K> {
    fn clone(&self) -> Self {
        InfiniteQueryRef {
            actor: self.actor.clone(),
        }
    }
}

impl<K: InfiniteQueryKey> fmt::Debug for InfiniteQueryRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryRef").field("id", self.id()).finish()
    }
}

/// Handle to a mutation.
pub struct MutationRef<K: MutationKey> {
    actor: Attached<MutationActor<K>>,
}

impl<K: MutationKey> MutationRef<K> {
    pub(crate) fn connect(actor: Arc<MutationActor<K>>) -> Self {
        MutationRef {
            actor: Attached(actor),
        }
    }

    pub fn id(&self) -> &UniqueId {
        self.actor.id()
    }

    pub fn state(&self) -> MutationState<K::Data> {
        self.actor.state()
    }

    pub fn watch(&self) -> watch::Receiver<MutationState<K::Data>> {
        self.actor.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationState<K::Data>> {
        self.actor.subscribe()
    }

    /// Submit `variable` and wait for the result.
    ///
    /// Submissions on the same key run one after another in submission order.
    pub async fn mutate(&self, variable: K::Variable) -> Result<K::Data, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.actor.mutate(variable, Some(tx));
        rx.await.map_err(|_| CacheError::Closed(self.id().to_string()))?
    }

    /// Submit `variable` without waiting. The outcome is published as state.
    pub fn mutate_async(&self, variable: K::Variable) {
        self.actor.mutate(variable, None);
    }

    /// Return to the idle state.
    pub fn reset(&self) {
        self.actor.reset();
    }

    pub fn close(self) {}
}

impl<K: MutationKey> Clone for MutationRef<K> {
    fn clone(&self) -> Self {
        MutationRef {
            actor: self.actor.clone(),
        }
    }
}

impl<K: MutationKey> fmt::Debug for MutationRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationRef").field("id", self.id()).finish()
    }
}

/// Handle to a subscription.
pub struct SubscriptionRef<K: SubscriptionKey> {
    actor: Attached<SubscriptionActor<K>>,
}

impl<K: SubscriptionKey> SubscriptionRef<K> {
    pub(crate) fn connect(actor: Arc<SubscriptionActor<K>>) -> Self {
        actor.send(SubscriptionCommand::Connect);
        SubscriptionRef {
            actor: Attached(actor),
        }
    }

    pub fn id(&self) -> &UniqueId {
        self.actor.id()
    }

    pub fn state(&self) -> SubscriptionState<K::Data> {
        self.actor.state()
    }

    pub fn watch(&self) -> watch::Receiver<SubscriptionState<K::Data>> {
        self.actor.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubscriptionState<K::Data>> {
        self.actor.subscribe()
    }

    /// Reopen the stream if it failed or completed.
    pub fn resume(&self) {
        self.actor.send(SubscriptionCommand::Resume);
    }

    /// Close and reopen the stream.
    pub fn reset(&self) {
        self.actor.send(SubscriptionCommand::Reset);
    }

    pub fn close(self) {}
}

impl<K: SubscriptionKey> Clone for SubscriptionRef<K> {
    fn clone(&self) -> Self {
        SubscriptionRef {
            actor: self.actor.clone(),
        }
    }
}

impl<K: SubscriptionKey> fmt::Debug for SubscriptionRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRef").field("id", self.id()).finish()
    }
}
