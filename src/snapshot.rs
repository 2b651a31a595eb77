//! Serializable diagnostics of a cache.

use serde::Serialize;

use crate::error::CacheError;
use crate::filter::FilterTarget;
use crate::id::UniqueId;

/// One live key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySnapshot {
    pub id: UniqueId,
    pub subscribers: usize,
    pub stale: bool,
    pub failed: bool,
    pub paused: bool,
    pub pending: bool,
}

impl From<FilterTarget> for KeySnapshot {
    fn from(target: FilterTarget) -> Self {
        KeySnapshot {
            id: target.id,
            subscribers: target.subscribers,
            stale: target.is_stale,
            failed: target.is_failed,
            paused: target.is_paused,
            pending: target.is_pending,
        }
    }
}

/// Returned by [`SwrCache::snapshot`](crate::SwrCache::snapshot). Keys are sorted by id.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub queries: Vec<KeySnapshot>,
    pub mutations: Vec<KeySnapshot>,
    pub subscriptions: Vec<KeySnapshot>,
    /// Entries in the inactive-state cache, expired ones included.
    pub cached_states: usize,
    pub online: bool,
}

impl CacheSnapshot {
    pub fn to_json(&self) -> Result<String, CacheError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_to_json() {
        let snapshot = CacheSnapshot {
            queries: vec![KeySnapshot {
                id: UniqueId::query("posts").with_tag("page", 1),
                subscribers: 2,
                stale: false,
                failed: false,
                paused: false,
                pending: false,
            }],
            mutations: Vec::new(),
            subscriptions: Vec::new(),
            cached_states: 3,
            online: true,
        };

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["cached_states"], 3);
        assert_eq!(json["queries"][0]["subscribers"], 2);
        assert_eq!(json["queries"][0]["id"]["namespace"], "posts");
    }
}
