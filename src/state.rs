//! Immutable state snapshots published by actors.
//!
//! Every snapshot is a plain value. Actors build a new one for each transition
//! and publish it; observers only ever receive clones.

use serde::Serialize;
use tokio::time::Instant;

use crate::error::CacheError;
use crate::id::UniqueId;

/// The last successfully produced value, if any.
pub type Reply<T> = Option<T>;

/// A failure together with where and when it happened.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub id: UniqueId,
    pub error: CacheError,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Success,
    Failure,
}

/// Whether a query is currently talking to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Idle,
    Fetching,
    /// Retries were halted because the network is unavailable.
    Paused,
}

/// Snapshot of one query key.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub reply: Reply<T>,
    pub reply_updated_at: Option<Instant>,
    pub error: Option<ErrorRecord>,
    pub error_updated_at: Option<Instant>,
    /// When the current reply stops being fresh. `None` means stale.
    pub stale_at: Option<Instant>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub is_invalidated: bool,
    /// Number of fetches that completed successfully.
    pub fetched_count: u64,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        QueryState {
            reply: None,
            reply_updated_at: None,
            error: None,
            error_updated_at: None,
            stale_at: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
            fetched_count: 0,
        }
    }
}

impl<T> QueryState<T> {
    /// A successful state holding `data`, fresh until `stale_at`.
    pub fn success(data: T, updated_at: Instant, stale_at: Instant) -> Self {
        QueryState {
            reply: Some(data),
            reply_updated_at: Some(updated_at),
            stale_at: Some(stale_at),
            status: QueryStatus::Success,
            ..Default::default()
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == QueryStatus::Failure
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// Stale once `stale_at` has passed, when nothing was fetched yet, or when invalidated.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.is_invalidated || self.stale_at.is_none_or(|at| now >= at)
    }

    /// Transition to a successful fetch. Clears the error and invalidation.
    pub(crate) fn with_reply(&self, data: T, now: Instant, stale_at: Instant) -> Self {
        QueryState {
            reply: Some(data),
            reply_updated_at: Some(now),
            error: None,
            error_updated_at: self.error_updated_at,
            stale_at: Some(stale_at),
            status: QueryStatus::Success,
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
            fetched_count: self.fetched_count + 1,
        }
    }

    /// Transition to a failed fetch. The last good reply is kept.
    pub(crate) fn with_error(&self, error: ErrorRecord, fetch_status: FetchStatus) -> Self
    where
        T: Clone,
    {
        QueryState {
            reply: self.reply.clone(),
            reply_updated_at: self.reply_updated_at,
            error_updated_at: Some(error.at),
            error: Some(error),
            stale_at: self.stale_at,
            status: QueryStatus::Failure,
            fetch_status,
            is_invalidated: self.is_invalidated,
            fetched_count: self.fetched_count,
        }
    }

    pub(crate) fn with_fetch_status(&self, fetch_status: FetchStatus) -> Self
    where
        T: Clone,
    {
        QueryState {
            fetch_status,
            ..self.clone()
        }
    }

    pub(crate) fn invalidated(&self) -> Self
    where
        T: Clone,
    {
        QueryState {
            is_invalidated: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Failure,
}

/// Snapshot of one mutation key.
#[derive(Debug, Clone)]
pub struct MutationState<T> {
    pub reply: Reply<T>,
    pub reply_updated_at: Option<Instant>,
    pub error: Option<ErrorRecord>,
    pub error_updated_at: Option<Instant>,
    pub status: MutationStatus,
    pub mutated_count: u64,
    pub submitted_at: Option<Instant>,
}

impl<T> Default for MutationState<T> {
    fn default() -> Self {
        MutationState {
            reply: None,
            reply_updated_at: None,
            error: None,
            error_updated_at: None,
            status: MutationStatus::Idle,
            mutated_count: 0,
            submitted_at: None,
        }
    }
}

impl<T> MutationState<T> {
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == MutationStatus::Failure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Success,
    Failure,
}

/// Snapshot of one subscription key.
#[derive(Debug, Clone)]
pub struct SubscriptionState<T> {
    pub reply: Reply<T>,
    pub reply_updated_at: Option<Instant>,
    pub error: Option<ErrorRecord>,
    pub error_updated_at: Option<Instant>,
    pub status: SubscriptionStatus,
    pub restarted_at: Option<Instant>,
}

impl<T> Default for SubscriptionState<T> {
    fn default() -> Self {
        SubscriptionState {
            reply: None,
            reply_updated_at: None,
            error: None,
            error_updated_at: None,
            status: SubscriptionStatus::Pending,
            restarted_at: None,
        }
    }
}

impl<T> SubscriptionState<T> {
    pub fn is_pending(&self) -> bool {
        self.status == SubscriptionStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == SubscriptionStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == SubscriptionStatus::Failure
    }
}
