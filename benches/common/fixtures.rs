use async_trait::async_trait;
use rand::Rng;
use soil_query::{BoxError, QueryKey, Receiver, UniqueId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Test data structure for benchmarks
#[derive(Clone, Debug, PartialEq)]
pub struct BenchUser {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub score: u32,
}

impl BenchUser {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("User {}", id),
            email: format!("user{}@example.com", id),
            score: (id % 1000) as u32,
        }
    }
}

/// Simulated database with configurable latency
pub struct FakeDatabase {
    data: HashMap<u64, BenchUser>,
    latency_ms: u64,
    query_count: AtomicUsize,
}

impl FakeDatabase {
    pub fn new(num_users: usize, latency_ms: u64) -> Self {
        let data = (0..num_users as u64).map(|id| (id, BenchUser::new(id))).collect();
        Self {
            data,
            latency_ms,
            query_count: AtomicUsize::new(0),
        }
    }

    pub async fn get(&self, id: u64) -> Option<BenchUser> {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        // Simulate database latency
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;

        self.data.get(&id).cloned()
    }

    #[allow(dead_code)]
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    /// A receiver carrying this database, for building caches.
    pub fn into_receiver(self: Arc<Self>) -> Receiver {
        let mut receiver = Receiver::new();
        receiver.insert(self);
        receiver
    }
}

/// Query for one user by id.
pub struct GetUser(pub u64);

#[async_trait]
impl QueryKey for GetUser {
    type Data = Option<BenchUser>;

    fn id(&self) -> UniqueId {
        UniqueId::query("users").with_tag("user_id", self.0)
    }

    async fn fetch(&self, receiver: &Receiver) -> Result<Option<BenchUser>, BoxError> {
        let db = receiver.get::<FakeDatabase>()?;
        Ok(db.get(self.0).await)
    }
}

/// Generate user ids for different workload patterns
pub struct KeyGenerator {
    num_keys: u64,
}

impl KeyGenerator {
    pub fn new(num_keys: u64) -> Self {
        Self { num_keys }
    }

    pub fn sequential(&self) -> Vec<u64> {
        (0..self.num_keys).collect()
    }

    /// Ids for a mixed workload: `hit_ratio` of them fall into the hot set.
    pub fn mixed(&self, hit_ratio: f64, count: usize) -> Vec<u64> {
        let mut rng = rand::thread_rng();
        let hot_key_count = ((self.num_keys as f64 * hit_ratio) as u64).max(1);

        (0..count)
            .map(|_| {
                if rng.gen_bool(hit_ratio) {
                    rng.gen_range(0..hot_key_count)
                } else {
                    rng.gen_range(hot_key_count..self.num_keys)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_database() {
        let db = FakeDatabase::new(100, 1);

        let user = db.get(0).await;
        assert_eq!(user.map(|user| user.id), Some(0));
        assert_eq!(db.query_count(), 1);
    }

    #[test]
    fn test_key_generator() {
        let key_gen = KeyGenerator::new(100);
        assert_eq!(key_gen.sequential().len(), 100);

        let mixed = key_gen.mixed(0.8, 500);
        assert_eq!(mixed.len(), 500);
        assert!(mixed.iter().all(|id| *id < 100));
    }
}
