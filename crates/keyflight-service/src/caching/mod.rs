//! # Request-coalescing value cache
//!
//! The caching layer puts a request-coalescing load path in front of a pluggable key/value
//! [`Storage`] backend.
//!
//! A request goes through the following steps:
//! - First, the value is looked up in the storage backend. A hit is returned right away without
//!   synchronizing with any other caller.
//! - On miss, the caller joins the in-flight computation for the same key, or starts a new one.
//!   Only the computation runs the loader; every caller that joined it receives the same result.
//! - A successful result is written to the storage backend with the configured TTL. What happens
//!   when that write fails is decided by the [`SetErrorPolicy`] of the cache.
//! - The computation is then forgotten. The next miss on the same key starts a fresh load.
//!
//! Errors are never cached and never retried automatically.
//!
//! ### Metrics
//!
//! Each metric is tagged with a `cache` field that corresponds to the name of the cache:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the storage backend.
//! - `caches.channel.hit`: Accesses that joined an already running computation.
//! - `caches.channel.miss`: Accesses that started a new computation.
//! - `caches.computation`: Loader invocations.
//! - `caches.store.error`: Failed writes to the storage backend.

mod cache_error;
mod memory;
mod noop;
mod storage;
#[cfg(test)]
mod tests;
mod value_cache;

pub use cache_error::{CacheEntry, CacheError};
pub use memory::MemoryStorage;
pub use noop::NoopCache;
pub use storage::{Storage, StorageError};
pub use value_cache::{ErrorLogger, SetErrorPolicy, ValueCache};

use std::future::Future;

use crate::BoxError;

/// A cache that can load missing values on demand.
///
/// Implemented by [`ValueCache`] and by [`NoopCache`], so that callers can switch off caching
/// without touching their call sites.
pub trait Cache<V>: Send + Sync {
    /// Returns the value stored for `key`, running `loader` to produce it on a miss.
    fn get_and_load<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
    ) -> impl Future<Output = CacheEntry<V>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static;
}
