//! Structural identities for queries, mutations and subscriptions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a key describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Query,
    InfiniteQuery,
    Mutation,
    Subscription,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Query => "query",
            KeyKind::InfiniteQuery => "infinite_query",
            KeyKind::Mutation => "mutation",
            KeyKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a key: a kind, a namespace and an ordered list of tags.
///
/// Equality and hashing are structural. Tags are compared position-wise, so
/// `[("a", "1"), ("b", "2")]` and `[("b", "2"), ("a", "1")]` are different ids.
///
/// # Example
/// ```ignore
/// let id = UniqueId::query("posts/detail").with_tag("post_id", 42);
/// assert_eq!(id.to_string(), "query:posts/detail[post_id=42]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    kind: KeyKind,
    namespace: String,
    tags: Vec<(String, String)>,
}

impl UniqueId {
    pub fn new(kind: KeyKind, namespace: impl Into<String>) -> Self {
        UniqueId {
            kind,
            namespace: namespace.into(),
            tags: Vec::new(),
        }
    }

    pub fn query(namespace: impl Into<String>) -> Self {
        Self::new(KeyKind::Query, namespace)
    }

    pub fn infinite_query(namespace: impl Into<String>) -> Self {
        Self::new(KeyKind::InfiniteQuery, namespace)
    }

    pub fn mutation(namespace: impl Into<String>) -> Self {
        Self::new(KeyKind::Mutation, namespace)
    }

    pub fn subscription(namespace: impl Into<String>) -> Self {
        Self::new(KeyKind::Subscription, namespace)
    }

    /// Append a tag. Order of calls is part of the identity.
    pub fn with_tag(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.tags.push((name.into(), value.to_string()));
        self
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Look up the first tag with the given name.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Segment-aware namespace prefix match.
    ///
    /// `posts/1` matches `posts`, `posts/`, `posts/*` and `posts/1`, but not `post`.
    pub fn has_namespace_prefix(&self, prefix: &str) -> bool {
        let prefix = prefix.strip_suffix('*').unwrap_or(prefix);
        let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
        if prefix.is_empty() {
            return true;
        }
        match self.namespace.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Whether every `(name, value)` pair in `tags` is present on this id.
    pub fn contains_tags(&self, tags: &[(String, String)]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.namespace)?;
        if self.tags.is_empty() {
            return Ok(());
        }
        f.write_str("[")?;
        for (i, (name, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        f.write_str("]")
    }
}
