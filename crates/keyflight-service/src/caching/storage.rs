use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::BoxError;

/// An error reported by a [`Storage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend refuses to hold this kind of value, for example because it is too large.
    #[error("value rejected by storage backend: {0}")]
    Rejected(String),
    /// The backend itself failed.
    #[error("storage backend failure")]
    Backend(#[source] BoxError),
}

/// A key/value store with TTL semantics, backing a [`ValueCache`](super::ValueCache).
///
/// Implementations are expected to be safe for concurrent use; the cache does not add any
/// locking around them.
pub trait Storage<V>: Send + Sync {
    /// Returns the value stored for `key`.
    ///
    /// Absent and expired entries both yield `Ok(None)`. Stale data is never returned.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<V>, StorageError>>;

    /// Stores `value` under `key` for `ttl`, unconditionally replacing any previous value.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: V,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StorageError>>;
}
