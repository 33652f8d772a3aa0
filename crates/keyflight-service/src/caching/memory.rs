use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};

use crate::time::Instant;

use super::{Storage, StorageError};

/// Longest TTL handed to moka. Items living longer are only expired by their deadline.
const MAX_EXPIRY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct MemoryItem<V> {
    /// When this item stops being visible to readers. `None` if it never does.
    deadline: Option<Instant>,
    /// The TTL the item was stored with, driving moka's own eviction.
    ttl: Duration,
    /// The actual data.
    value: V,
}

/// A struct implementing [`moka::Expiry`] that evicts items once their TTL has elapsed.
struct ItemExpiration;

impl<V> moka::Expiry<String, MemoryItem<V>> for ItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryItem<V>,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        moka_expiry(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryItem<V>,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        moka_expiry(value.ttl)
    }
}

fn moka_expiry(ttl: Duration) -> Option<Duration> {
    (ttl <= MAX_EXPIRY).then_some(ttl)
}

/// An in-process [`Storage`] backend.
///
/// Expired items are evicted by moka in the background. Reads additionally compare against the
/// item deadline, so an item is never handed out once its TTL has passed, even if it was not
/// swept yet.
///
/// Storing an item with a zero TTL uses the default TTL of the storage instead.
pub struct MemoryStorage<V> {
    default_ttl: Duration,
    items: moka::sync::Cache<String, MemoryItem<V>>,
}

impl<V> std::fmt::Debug for MemoryStorage<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("default_ttl", &self.default_ttl)
            .field("items", &self.items.entry_count())
            .finish()
    }
}

impl<V> MemoryStorage<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a storage holding at most `capacity` items.
    pub fn new(default_ttl: Duration, capacity: u64) -> Self {
        let items = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .expire_after(ItemExpiration)
            .build();

        Self { default_ttl, items }
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let item = self.items.get(key)?;
        // Expired items are left to moka, a concurrent `store` may already have replaced them.
        match item.deadline {
            Some(deadline) if deadline <= Instant::now() => None,
            _ => Some(item.value),
        }
    }

    fn store(&self, key: &str, value: V, ttl: Duration) {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let item = MemoryItem {
            deadline: Instant::now().checked_add(ttl),
            ttl,
            value,
        };
        self.items.insert(key.to_owned(), item);
    }
}

impl<V> Storage<V> for MemoryStorage<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<V>, StorageError>> {
        future::ready(Ok(self.lookup(key))).boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: V,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        self.store(key, value, ttl);
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_ttl() {
        let storage = MemoryStorage::new(Duration::from_secs(60), 100);
        storage
            .set("k", 42u32, Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(storage.get("k").await.unwrap(), Some(42));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_uses_default() {
        let storage = MemoryStorage::new(Duration::from_secs(10), 100);
        storage.set("k", "v", Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(storage.get("k").await.unwrap(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let storage = MemoryStorage::new(Duration::from_secs(60), 100);
        storage.set("k", 1u32, Duration::MAX).await.unwrap();

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert_eq!(storage.get("k").await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_item_is_replaced() {
        let storage = MemoryStorage::new(Duration::from_secs(60), 100);
        storage.set("k", 1u32, Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(storage.get("k").await.unwrap(), None);

        storage.set("k", 2u32, Duration::from_secs(1)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites() {
        let storage = MemoryStorage::new(Duration::from_secs(10), 100);
        storage.set("k", 1, Duration::from_secs(1)).await.unwrap();
        storage.set("k", 2, Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(storage.get("k").await.unwrap(), Some(2));
        assert_eq!(storage.get("missing").await.unwrap(), None);
    }
}
