//! Per-kind behavior options.
//!
//! The cache holds defaults for each kind; a key may override them by
//! returning its own options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheError;
use crate::retry::{RetryOptions, RetryPredicate};

/// Options for queries and infinite queries.
#[derive(Clone)]
pub struct QueryOptions {
    /// How long a successful reply stays fresh.
    pub stale_time: Duration,
    /// How long the last state is kept after the actor is destroyed.
    pub gc_time: Duration,
    /// Grace period an actor survives after its last subscriber leaves.
    pub keep_alive_time: Duration,
    /// Revalidate a stale reply when a new subscriber connects.
    pub revalidate_on_mount: bool,
    /// Revalidate stale active queries when the window returns to the foreground.
    pub revalidate_on_focus: bool,
    /// Resume failed or paused queries when the network comes back.
    pub revalidate_on_reconnect: bool,
    /// Let the background sweep revalidate active queries once they turn stale.
    pub revalidate_on_stale: bool,
    /// Do not forward failures to [`SwrCache::errors`](crate::SwrCache::errors).
    pub suppress_error_relay: bool,
    /// Classifies errors as network failures; those halt retries while offline.
    pub is_network_error: RetryPredicate,
    pub retry: RetryOptions,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            stale_time: Duration::ZERO,
            gc_time: Duration::from_secs(5 * 60),
            keep_alive_time: Duration::from_secs(5),
            revalidate_on_mount: true,
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            revalidate_on_stale: false,
            suppress_error_relay: false,
            is_network_error: Arc::new(CacheError::is_network),
            retry: RetryOptions::default(),
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("keep_alive_time", &self.keep_alive_time)
            .field("revalidate_on_mount", &self.revalidate_on_mount)
            .field("revalidate_on_focus", &self.revalidate_on_focus)
            .field("revalidate_on_reconnect", &self.revalidate_on_reconnect)
            .field("revalidate_on_stale", &self.revalidate_on_stale)
            .field("suppress_error_relay", &self.suppress_error_relay)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Options for mutations.
#[derive(Clone)]
pub struct MutationOptions {
    pub keep_alive_time: Duration,
    /// Reject further submissions once a mutation succeeded.
    pub is_one_shot: bool,
    pub suppress_error_relay: bool,
    pub retry: RetryOptions,
}

impl Default for MutationOptions {
    fn default() -> Self {
        MutationOptions {
            keep_alive_time: Duration::from_secs(5),
            is_one_shot: false,
            suppress_error_relay: false,
            retry: RetryOptions::default(),
        }
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("keep_alive_time", &self.keep_alive_time)
            .field("is_one_shot", &self.is_one_shot)
            .field("suppress_error_relay", &self.suppress_error_relay)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Options for subscriptions.
#[derive(Clone)]
pub struct SubscriptionOptions {
    pub gc_time: Duration,
    pub keep_alive_time: Duration,
    /// Resume a failed subscription when the network comes back.
    pub revalidate_on_reconnect: bool,
    pub suppress_error_relay: bool,
    pub is_network_error: RetryPredicate,
    pub retry: RetryOptions,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        SubscriptionOptions {
            gc_time: Duration::from_secs(5 * 60),
            keep_alive_time: Duration::from_secs(5),
            revalidate_on_reconnect: true,
            suppress_error_relay: false,
            is_network_error: Arc::new(CacheError::is_network),
            retry: RetryOptions::default(),
        }
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("gc_time", &self.gc_time)
            .field("keep_alive_time", &self.keep_alive_time)
            .field("revalidate_on_reconnect", &self.revalidate_on_reconnect)
            .field("suppress_error_relay", &self.suppress_error_relay)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
