//! Dependency container handed to fetch, mutate and subscribe closures.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;

/// Environment dependencies (HTTP clients, repositories, ...) available to keys.
///
/// Dependencies are indexed by type. The receiver is owned by the cache and
/// shared read-only with every actor.
///
/// # Example
/// ```ignore
/// let receiver = Receiver::new().with(HttpClient::new());
///
/// // inside QueryKey::fetch
/// let client = receiver.get::<HttpClient>()?;
/// ```
#[derive(Clone, Default)]
pub struct Receiver {
    deps: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency, replacing any previous one of the same type.
    pub fn with<T: Send + Sync + 'static>(mut self, dependency: T) -> Self {
        self.insert(Arc::new(dependency));
        self
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, dependency: Arc<T>) {
        self.deps.insert(TypeId::of::<T>(), dependency);
    }

    /// Fetch a dependency.
    ///
    /// A missing dependency is a programmer error: the returned
    /// [`CacheError::MissingDependency`] is never retried.
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, CacheError> {
        self.deps
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|dep| dep.downcast::<T>().ok())
            .ok_or(CacheError::MissingDependency(type_name::<T>()))
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.deps.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("dependencies", &self.deps.len())
            .finish()
    }
}
