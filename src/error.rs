use std::error::Error as StdError;
use std::sync::Arc;

/// Error type returned by user-supplied fetch, mutate and subscribe closures.
///
/// Any error converts into it with `?`, so keys can use whatever client they like.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error type for cache operations.
///
/// Errors are cheap to clone so the same failure can sit in a published state
/// snapshot, travel through the error relay and be returned to a caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// A fetch, mutate or subscribe closure failed.
    #[error("{0}")]
    Failed(Arc<dyn StdError + Send + Sync + 'static>),
    /// A failure classified as a network problem.
    ///
    /// Retries of these are halted while the network is reported as lost.
    #[error("network error: {0}")]
    Network(String),
    /// The receiver does not carry a dependency a key asked for.
    ///
    /// This is a programmer error and is never retried.
    #[error("receiver is missing required dependency `{0}`")]
    MissingDependency(&'static str),
    /// The same id was requested with two different key types.
    #[error("key '{id}' is already registered with a different {kind} type")]
    KeyConflict { id: String, kind: &'static str },
    /// A one-shot mutation was submitted again after succeeding.
    #[error("mutation '{0}' has already succeeded")]
    AlreadyMutated(String),
    /// The operation was cancelled before it produced a result.
    #[error("operation cancelled")]
    Cancelled,
    /// The key holds no reply yet, for example because its first fetch has
    /// not finished or was cancelled.
    #[error("'{0}' has no reply yet")]
    NotLoaded(String),
    /// The actor serving this key has shut down.
    #[error("actor for '{0}' is closed")]
    Closed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Wrap an arbitrary error.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        CacheError::from(err.into())
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        CacheError::Network(message.into())
    }

    /// Whether the default retry policy should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Failed(_) | CacheError::Network(_))
    }

    /// Whether the error was classified as a network failure.
    pub fn is_network(&self) -> bool {
        matches!(self, CacheError::Network(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

impl From<BoxError> for CacheError {
    /// Closures may return a boxed `CacheError` (for example from `Receiver::get`);
    /// it is unwrapped instead of being nested inside `Failed`.
    fn from(err: BoxError) -> Self {
        match err.downcast::<CacheError>() {
            Ok(err) => *err,
            Err(err) => CacheError::Failed(Arc::from(err)),
        }
    }
}
