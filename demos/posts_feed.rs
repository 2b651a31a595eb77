//! Example wiring a small posts client through one cache.
//!
//! A paginated feed, a detail query and a mutation that invalidates the feed
//! share one fake API. Network connectivity is driven by hand to show how
//! paused queries resume once the network is back.
//!
//! Run with `RUST_LOG=soil_query=debug cargo run --example posts_feed`.

use async_trait::async_trait;
use parking_lot::Mutex;
use soil_query::{
    BoxError, CacheError, EventSource, Filter, InfiniteQueryKey, MutationKey,
    NetworkConnectivityEvent, QueryChunks, QueryEffect, QueryKey, Receiver, SwrCache, UniqueId,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
struct Post {
    id: u64,
    title: String,
}

/// Stands in for an HTTP client.
#[derive(Default)]
struct PostsApi {
    posts: Mutex<Vec<Post>>,
    offline: AtomicBool,
}

impl PostsApi {
    const PAGE_SIZE: usize = 2;

    async fn page(&self, page: usize) -> Result<Vec<Post>, CacheError> {
        self.round_trip().await?;
        let posts = self.posts.lock();
        Ok(posts.iter().rev().skip(page * Self::PAGE_SIZE).take(Self::PAGE_SIZE).cloned().collect())
    }

    async fn get(&self, id: u64) -> Result<Option<Post>, CacheError> {
        self.round_trip().await?;
        Ok(self.posts.lock().iter().find(|post| post.id == id).cloned())
    }

    async fn create(&self, title: String) -> Result<Post, CacheError> {
        self.round_trip().await?;
        let mut posts = self.posts.lock();
        let post = Post {
            id: posts.len() as u64 + 1,
            title,
        };
        posts.push(post.clone());
        Ok(post)
    }

    async fn round_trip(&self) -> Result<(), CacheError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::network("no route to host"));
        }
        Ok(())
    }
}

struct PostFeed;

#[async_trait]
impl InfiniteQueryKey for PostFeed {
    type Data = Vec<Post>;
    type Param = usize;

    fn id(&self) -> UniqueId {
        UniqueId::infinite_query("posts/feed")
    }

    fn initial_param(&self) -> usize {
        0
    }

    async fn fetch(&self, receiver: &Receiver, page: usize) -> Result<Vec<Post>, BoxError> {
        Ok(receiver.get::<PostsApi>()?.page(page).await?)
    }

    fn load_more_param(&self, chunks: &QueryChunks<Vec<Post>, usize>) -> Option<usize> {
        let last = chunks.last()?;
        (last.data.len() == PostsApi::PAGE_SIZE).then_some(last.param + 1)
    }
}

struct GetPost(u64);

#[async_trait]
impl QueryKey for GetPost {
    type Data = Option<Post>;

    fn id(&self) -> UniqueId {
        UniqueId::query("posts/detail").with_tag("post_id", self.0)
    }

    async fn fetch(&self, receiver: &Receiver) -> Result<Option<Post>, BoxError> {
        Ok(receiver.get::<PostsApi>()?.get(self.0).await?)
    }
}

struct CreatePost;

#[async_trait]
impl MutationKey for CreatePost {
    type Data = Post;
    type Variable = String;

    fn id(&self) -> UniqueId {
        UniqueId::mutation("posts/create")
    }

    async fn mutate(&self, receiver: &Receiver, title: String) -> Result<Post, BoxError> {
        Ok(receiver.get::<PostsApi>()?.create(title).await?)
    }

    fn on_query_update(&self, _title: &String, _post: &Post) -> Vec<QueryEffect> {
        vec![QueryEffect::Invalidate(Filter::namespace("posts/feed"))]
    }
}

fn titles(chunks: &QueryChunks<Vec<Post>, usize>) -> Vec<&str> {
    chunks
        .iter()
        .flat_map(|chunk| chunk.data.iter().map(|post| post.title.as_str()))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api = Arc::new(PostsApi::default());
    let network = Arc::new(EventSource::<NetworkConnectivityEvent>::new());
    let mut receiver = Receiver::new();
    receiver.insert(api.clone());

    let cache = SwrCache::builder()
        .receiver(receiver)
        .network_connectivity(network.clone())
        .build();

    let create = cache.get_mutation(CreatePost)?;
    for title in ["Hello", "Second post", "On caching", "Stale while revalidate"] {
        create.mutate(title.to_string()).await?;
    }

    // Load the feed page by page.
    let feed = cache.get_infinite_query(PostFeed)?;
    feed.resolve().await?;
    while feed.load_next().await? {}
    if let Some(chunks) = feed.state().reply {
        println!("Feed ({} pages): {:?}", chunks.len(), titles(&chunks));
    }

    // A new post invalidates the feed, which refetches every loaded page.
    let mut updates = feed.watch();
    let fetched = feed.state().fetched_count;
    create.mutate("Fresh from the oven".to_string()).await?;
    let chunks = updates.wait_for(|state| state.fetched_count > fetched).await?.reply.clone();
    if let Some(chunks) = chunks {
        println!("Feed after create: {:?}", titles(&chunks));
    }

    // Offline: the fetch is paused instead of burning retries.
    network.emit(NetworkConnectivityEvent::Lost);
    api.offline.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let post = cache.get_query(GetPost(1))?;
    if let Err(err) = post.resolve().await {
        println!("Post 1 while offline: {} (paused: {})", err, post.state().is_paused());
    }

    api.offline.store(false, Ordering::SeqCst);
    network.emit(NetworkConnectivityEvent::Available);
    let mut post_updates = post.watch();
    let state = post_updates.wait_for(|state| state.is_success()).await?.clone();
    println!("Post 1 after reconnect: {:?}", state.reply.flatten());

    println!("{}", cache.snapshot().await.to_json()?);
    cache.close().await;
    Ok(())
}
