//! Filters selecting keys for batch operations.

use tokio::time::Instant;

use crate::id::UniqueId;

/// Restricts a filter by subscriber count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    #[default]
    Any,
    /// At least one subscriber.
    Active,
    /// No subscribers (within the keep-alive window).
    Inactive,
}

/// Restricts a filter by the current state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPredicate {
    Stale,
    Failed,
    FailedOrPaused,
    Pending,
}

/// What a filter is evaluated against: an actor's id plus a summary of its state.
#[derive(Debug, Clone)]
pub struct FilterTarget {
    pub id: UniqueId,
    pub subscribers: usize,
    pub is_stale: bool,
    pub is_failed: bool,
    pub is_paused: bool,
    pub is_pending: bool,
    /// When the subscriber count last dropped to zero.
    pub idle_since: Option<Instant>,
}

/// Selects keys by namespace prefix, tags, activity and state.
///
/// # Example
/// ```ignore
/// // every failed query below `posts`
/// let filter = Filter::namespace("posts/*").with_status(StatusPredicate::Failed);
/// cache.resume_queries(&filter);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub namespace_prefix: Option<String>,
    pub tags: Vec<(String, String)>,
    pub activity: Activity,
    pub status: Option<StatusPredicate>,
}

impl Filter {
    /// Matches every key.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(prefix: impl Into<String>) -> Self {
        Filter {
            namespace_prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.tags.push((name.into(), value.to_string()));
        self
    }

    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_status(mut self, status: StatusPredicate) -> Self {
        self.status = Some(status);
        self
    }

    /// Match on the id alone, ignoring activity and status.
    pub fn matches_id(&self, id: &UniqueId) -> bool {
        if let Some(prefix) = &self.namespace_prefix
            && !id.has_namespace_prefix(prefix)
        {
            return false;
        }
        id.contains_tags(&self.tags)
    }

    pub fn matches(&self, target: &FilterTarget) -> bool {
        if !self.matches_id(&target.id) {
            return false;
        }
        let active = match self.activity {
            Activity::Any => true,
            Activity::Active => target.subscribers > 0,
            Activity::Inactive => target.subscribers == 0,
        };
        if !active {
            return false;
        }
        match self.status {
            None => true,
            Some(StatusPredicate::Stale) => target.is_stale,
            Some(StatusPredicate::Failed) => target.is_failed,
            Some(StatusPredicate::FailedOrPaused) => target.is_failed || target.is_paused,
            Some(StatusPredicate::Pending) => target.is_pending,
        }
    }
}
