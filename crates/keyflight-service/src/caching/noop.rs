use std::future::Future;
use std::marker::PhantomData;

use crate::BoxError;

use super::{Cache, CacheEntry, CacheError};

/// A [`Cache`] that does not cache anything.
///
/// Every call runs the loader and returns its result. Nothing is read from or written to any
/// storage, and concurrent calls are not coalesced.
#[derive(Debug)]
pub struct NoopCache<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> NoopCache<V> {
    pub fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<V> Default for NoopCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for NoopCache<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V> Cache<V> for NoopCache<V>
where
    V: Send + 'static,
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
        let key = key.to_owned();
        let load = loader();
        async move { load.await.map_err(|err| CacheError::load(&key, err.into())) }
    }
}
