use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::BoxError;
use crate::utils::futures::CallOnDrop;

use super::{Cache, CacheEntry, CacheError, Storage, StorageError};

type ComputationChannel<V> = Shared<oneshot::Receiver<CacheEntry<V>>>;
type ComputationMap<V> = Arc<Mutex<BTreeMap<String, ComputationChannel<V>>>>;

/// Callback invoked for every failed write to the storage backend.
pub type ErrorLogger = Arc<dyn Fn(&str, &StorageError) + Send + Sync>;

/// What to do when a loaded value cannot be written to the storage backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetErrorPolicy {
    /// Hand the loaded value to all waiters anyway. It is simply not persisted.
    Ignore,
    /// Fail the load for all waiters.
    #[default]
    Propagate,
}

impl SetErrorPolicy {
    /// Maps the `ignore_set_errors` configuration flag to a policy.
    pub fn from_ignore_flag(ignore_set_errors: bool) -> Self {
        if ignore_set_errors {
            Self::Ignore
        } else {
            Self::Propagate
        }
    }
}

/// Settings shared by the cache and its spawned computations.
struct Inner<V> {
    name: String,
    storage: Arc<dyn Storage<V>>,
    ttl: Duration,
    set_errors: SetErrorPolicy,
    error_logger: Option<ErrorLogger>,
}

/// Puts a request-coalescing load path in front of a [`Storage`] backend.
///
/// Concurrent misses for the same key are deduplicated: only one loader runs, and all callers
/// that asked in the meantime receive its result.
pub struct ValueCache<V> {
    inner: Arc<Inner<V>>,

    /// Used for deduplicating concurrent loads.
    current_computations: ComputationMap<V>,
}

impl<V> Clone for ValueCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            current_computations: Arc::clone(&self.current_computations),
        }
    }
}

impl<V> std::fmt::Debug for ValueCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self
            .current_computations
            .try_lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("ValueCache")
            .field("name", &self.inner.name)
            .field("ttl", &self.inner.ttl)
            .field("set_errors", &self.inner.set_errors)
            .field("running computations", &running)
            .finish()
    }
}

impl<V> ValueCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache storing loaded values in `storage` for `ttl`.
    ///
    /// The `name` is only used to tag logs and metrics. The optional `error_logger` is told about
    /// every failed write to the storage backend, regardless of the [`SetErrorPolicy`].
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn Storage<V>>,
        ttl: Duration,
        set_errors: SetErrorPolicy,
        error_logger: Option<ErrorLogger>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                storage,
                ttl,
                set_errors,
                error_logger,
            }),
            current_computations: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Returns the value for `key`, loading it on a miss.
    ///
    /// On a storage hit, `loader` is not invoked and no synchronization with other callers
    /// happens. On a miss, the loader of at most one caller runs per key at a time; everyone else
    /// waits for and adopts that result, error or value.
    ///
    /// # Errors
    ///
    /// Loader failures are returned as [`CacheError::Load`]. A failed write to the storage
    /// backend is returned as [`CacheError::Store`], unless the cache was configured with
    /// [`SetErrorPolicy::Ignore`]. Failures are never cached.
    pub async fn get_and_load<F, Fut, E>(&self, key: &str, loader: F) -> CacheEntry<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let name = self.inner.name.as_str();
        metric!(counter("caches.access") += 1, "cache" => name);

        match self.inner.storage.get(key).await {
            Ok(Some(value)) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                return Ok(value);
            }
            Ok(None) => {}
            Err(err) => {
                // A broken backend read is as good as a miss.
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    cache = name,
                    key,
                    "Failed to read from storage backend",
                );
            }
        }

        self.join_computation(key, loader).await
    }

    /// Joins the running computation for `key`, or spawns a new one.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// computation on an executor, even if the returned future is never awaited.
    fn join_computation<F, Fut, E>(&self, key: &str, loader: F) -> BoxFuture<'static, CacheEntry<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let name = self.inner.name.as_str();

        let channel = {
            let mut current_computations = self.current_computations.lock();
            if let Some(channel) = current_computations.get(key) {
                metric!(counter("caches.channel.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, key, "Joining in-flight computation");
                channel.clone()
            } else {
                metric!(counter("caches.channel.miss") += 1, "cache" => name);
                let computation = load_and_store(Arc::clone(&self.inner), key.to_owned(), loader());
                let channel = self.create_channel(key.to_owned(), computation);
                let evicted = current_computations.insert(key.to_owned(), channel.clone());
                debug_assert!(evicted.is_none());
                channel
            }
        };

        let key = key.to_owned();
        Box::pin(channel.map(move |result| {
            result.unwrap_or_else(|_cancelled| Err(CacheError::Interrupted { key }))
        }))
    }

    /// Spawns `computation` and returns a shareable channel to its result.
    ///
    /// The computation is removed from the map before its result is published, so callers
    /// either get a channel that will receive data, or they start a new computation.
    fn create_channel<Fut>(&self, key: String, computation: Fut) -> ComputationChannel<V>
    where
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let current_computations = Arc::clone(&self.current_computations);
        let remove_computation_token = CallOnDrop::new(move || {
            current_computations.lock().remove(&key);
        });

        let channel = async move {
            let result = computation.await;
            drop(remove_computation_token);
            sender.send(result).ok();
        };

        tokio::spawn(channel);

        receiver.shared()
    }
}

/// Runs the loader and writes its value to the storage backend.
async fn load_and_store<V, Fut, E>(inner: Arc<Inner<V>>, key: String, loader: Fut) -> CacheEntry<V>
where
    V: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>>,
    E: Into<BoxError> + 'static,
{
    let name = inner.name.as_str();
    metric!(counter("caches.computation") += 1, "cache" => name);
    tracing::debug!(cache = name, key, "Loading value");

    let value = loader.await.map_err(|err| CacheError::load(&key, err.into()))?;

    if let Err(err) = inner.storage.set(&key, value.clone(), inner.ttl).await {
        metric!(counter("caches.store.error") += 1, "cache" => name);
        if let Some(logger) = &inner.error_logger {
            logger(&key, &err);
        }

        match inner.set_errors {
            SetErrorPolicy::Ignore => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    cache = name,
                    key,
                    "Failed to store value, returning it without caching",
                );
            }
            SetErrorPolicy::Propagate => return Err(CacheError::store(&key, err)),
        }
    }

    Ok(value)
}

impl<V> Cache<V> for ValueCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get_and_load<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
    ) -> impl Future<Output = CacheEntry<V>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        ValueCache::get_and_load(self, key, loader)
    }
}
