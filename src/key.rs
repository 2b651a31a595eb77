//! Traits implemented by applications to describe their queries, mutations
//! and subscriptions.
//!
//! # Example
//!
//! ```ignore
//! struct GetPost(u64);
//!
//! #[async_trait]
//! impl QueryKey for GetPost {
//!     type Data = Post;
//!
//!     fn id(&self) -> UniqueId {
//!         UniqueId::query("posts/detail").with_tag("post_id", self.0)
//!     }
//!
//!     async fn fetch(&self, receiver: &Receiver) -> Result<Post, BoxError> {
//!         let client = receiver.get::<HttpClient>()?;
//!         Ok(client.get_post(self.0).await?)
//!     }
//! }
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BoxError;
use crate::filter::Filter;
use crate::id::UniqueId;
use crate::options::{MutationOptions, QueryOptions, SubscriptionOptions};
use crate::receiver::Receiver;

/// A read that is cached by id.
#[async_trait]
pub trait QueryKey: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;

    fn id(&self) -> UniqueId;

    async fn fetch(&self, receiver: &Receiver) -> Result<Self::Data, BoxError>;

    /// Override the cache-wide query options for this key.
    fn options(&self) -> Option<QueryOptions> {
        None
    }

    /// Data to show before the first fetch completes. It is treated as stale.
    fn initial_data(&self) -> Option<Self::Data> {
        None
    }
}

/// One page of an infinite query together with the param that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryChunk<T, S> {
    pub data: T,
    pub param: S,
}

pub type QueryChunks<T, S> = Vec<QueryChunk<T, S>>;

/// A paginated read whose pages are accumulated in order.
#[async_trait]
pub trait InfiniteQueryKey: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;
    /// Compared against [`load_more_param`](Self::load_more_param) so a page
    /// is only appended where the loaded chunks end.
    type Param: Clone + PartialEq + Send + Sync + 'static;

    fn id(&self) -> UniqueId;

    /// Param for the first page.
    fn initial_param(&self) -> Self::Param;

    async fn fetch(&self, receiver: &Receiver, param: Self::Param) -> Result<Self::Data, BoxError>;

    /// Param for the page after `chunks`, or `None` when there is nothing more to load.
    fn load_more_param(&self, chunks: &QueryChunks<Self::Data, Self::Param>) -> Option<Self::Param>;

    fn options(&self) -> Option<QueryOptions> {
        None
    }
}

/// Follow-up work on queries after a mutation succeeded.
#[derive(Debug, Clone)]
pub enum QueryEffect {
    Invalidate(Filter),
    Resume(Filter),
    Remove(Filter),
}

/// A write. Results are published as state but never cached by id.
#[async_trait]
pub trait MutationKey: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;
    /// Input of one submission. Cloned for each retry.
    type Variable: Clone + Send + Sync + 'static;

    fn id(&self) -> UniqueId;

    async fn mutate(
        &self,
        receiver: &Receiver,
        variable: Self::Variable,
    ) -> Result<Self::Data, BoxError>;

    fn options(&self) -> Option<MutationOptions> {
        None
    }

    /// Effects applied to queries after a successful mutation, e.g.
    /// invalidating the list the new item belongs to.
    fn on_query_update(&self, _variable: &Self::Variable, _data: &Self::Data) -> Vec<QueryEffect> {
        Vec::new()
    }
}

/// A long-lived stream of values.
pub trait SubscriptionKey: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;

    fn id(&self) -> UniqueId;

    /// Open the stream. It is reopened after errors and on reset.
    fn subscribe(&self, receiver: &Receiver) -> BoxStream<'static, Result<Self::Data, BoxError>>;

    fn options(&self) -> Option<SubscriptionOptions> {
        None
    }
}
