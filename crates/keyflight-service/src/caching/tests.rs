use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

use super::*;

/// A loader that counts its invocations, sleeps for a bit and returns a fixed value.
#[derive(Clone, Default)]
struct CountingLoader {
    calls: Arc<AtomicUsize>,
}

impl CountingLoader {
    fn load<V: Send + 'static>(
        &self,
        delay: Duration,
        result: Result<V, &'static str>,
    ) -> impl Future<Output = Result<V, &'static str>> + Send + use<V> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(delay).await;
            result
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A storage backend that never holds anything and fails every write.
#[derive(Default)]
struct RejectingStorage {
    writes: AtomicUsize,
}

impl<V: Send + 'static> Storage<V> for RejectingStorage {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<V>, StorageError>> {
        future::ready(Ok(None)).boxed()
    }

    fn set<'a>(
        &'a self,
        _key: &'a str,
        _value: V,
        _ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        future::ready(Err(StorageError::Rejected("too large".into()))).boxed()
    }
}

/// A storage backend whose reads always fail.
struct BrokenReads<V> {
    inner: MemoryStorage<V>,
}

impl<V: Clone + Send + Sync + 'static> Storage<V> for BrokenReads<V> {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<V>, StorageError>> {
        future::ready(Err(StorageError::Backend("connection reset".into()))).boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: V,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        self.inner.set(key, value, ttl)
    }
}

fn memory_cache<V: Clone + Send + Sync + 'static>(ttl: Duration) -> ValueCache<V> {
    let storage = Arc::new(MemoryStorage::new(ttl, 1_000));
    ValueCache::new("test", storage, ttl, SetErrorPolicy::Propagate, None)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads_are_coalesced() {
    keyflight_test::setup();

    let cache = memory_cache::<u32>(Duration::from_secs(5));
    let loader = CountingLoader::default();

    let start = tokio::time::Instant::now();
    let requests = (0..10).map(|_| {
        cache.get_and_load("k", || loader.load(Duration::from_millis(50), Ok(42)))
    });
    let results = future::join_all(requests).await;

    assert_eq!(loader.calls(), 1);
    assert!(results.iter().all(|r| matches!(r, Ok(42))));
    // all callers waited for the single load, not for ten sequential ones
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_cancel_load() {
    keyflight_test::setup();

    let cache = memory_cache::<u32>(Duration::from_secs(5));
    let loader = CountingLoader::default();

    let mut first = Box::pin(cache.get_and_load("k", || {
        loader.load(Duration::from_millis(50), Ok(42))
    }));
    // a single poll is enough to start the load
    assert!(futures::poll!(first.as_mut()).is_pending());
    drop(first);

    let second = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok(7)))
        .await;
    assert_eq!(second.unwrap(), 42);
    assert_eq!(loader.calls(), 1);

    // the value was stored as well
    let third = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok(7)))
        .await;
    assert_eq!(third.unwrap(), 42);
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hit_does_not_invoke_loader() {
    keyflight_test::setup();

    let cache = memory_cache::<&'static str>(Duration::from_secs(5));
    let loader = CountingLoader::default();

    let first = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok("first")))
        .await;
    let second = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok("second")))
        .await;

    assert_eq!(first.unwrap(), "first");
    assert_eq!(second.unwrap(), "first");
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reload_after_ttl() {
    keyflight_test::setup();

    let cache = memory_cache::<u32>(Duration::from_secs(5));
    let loader = CountingLoader::default();

    let first = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok(1)))
        .await;
    assert_eq!(first.unwrap(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;

    let second = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok(2)))
        .await;
    assert_eq!(second.unwrap(), 2);
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_loader_error_is_shared_and_not_cached() {
    keyflight_test::setup();

    let cache = memory_cache::<u32>(Duration::from_secs(5));
    let loader = CountingLoader::default();

    let requests = (0..5).map(|_| {
        cache.get_and_load("k", || loader.load(Duration::from_millis(10), Err("boom")))
    });
    let results = future::join_all(requests).await;

    assert_eq!(loader.calls(), 1);
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, CacheError::Load { .. }));
        assert_eq!(err.key(), "k");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "boom");
    }

    // the failure is not remembered, the next call loads again
    let retry = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok(7)))
        .await;
    assert_eq!(retry.unwrap(), 7);
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_keys_load_independently() {
    keyflight_test::setup();

    let cache = memory_cache::<&'static str>(Duration::from_secs(5));
    let loader = CountingLoader::default();

    let (a, b) = futures::join!(
        cache.get_and_load("a", || loader.load(Duration::from_millis(10), Ok("a"))),
        cache.get_and_load("b", || loader.load(Duration::from_millis(10), Ok("b"))),
    );

    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_ignored_set_errors_return_value() {
    keyflight_test::setup();

    let storage = Arc::new(RejectingStorage::default());
    let logged = Arc::new(Mutex::new(Vec::new()));
    let error_logger: ErrorLogger = {
        let logged = Arc::clone(&logged);
        Arc::new(move |key: &str, err: &StorageError| {
            logged.lock().push(format!("{key}: {err}"));
        })
    };
    let cache = ValueCache::<u32>::new(
        "test",
        storage.clone(),
        Duration::from_secs(5),
        SetErrorPolicy::Ignore,
        Some(error_logger),
    );
    let loader = CountingLoader::default();

    let result = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok(42u32)))
        .await;
    assert_eq!(result.unwrap(), 42);

    // nothing was persisted, so the next call loads again
    let result = cache
        .get_and_load("k", || loader.load(Duration::ZERO, Ok(43u32)))
        .await;
    assert_eq!(result.unwrap(), 43);

    assert_eq!(loader.calls(), 2);
    assert_eq!(storage.writes.load(Ordering::SeqCst), 2);
    assert_eq!(
        *logged.lock(),
        vec![
            "k: value rejected by storage backend: too large".to_owned(),
            "k: value rejected by storage backend: too large".to_owned(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_propagated_set_errors_fail_all_waiters() {
    keyflight_test::setup();

    let storage = Arc::new(RejectingStorage::default());
    let cache = ValueCache::<u32>::new(
        "test",
        storage.clone(),
        Duration::from_secs(5),
        SetErrorPolicy::Propagate,
        None,
    );
    let loader = CountingLoader::default();

    let requests = (0..3).map(|_| {
        cache.get_and_load("k", || loader.load(Duration::from_millis(10), Ok(42u32)))
    });
    let results = future::join_all(requests).await;

    assert_eq!(loader.calls(), 1);
    assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    for result in results {
        assert!(matches!(result, Err(CacheError::Store { .. })));
    }
}

#[tokio::test(start_paused = true)]
async fn test_storage_read_errors_count_as_miss() {
    keyflight_test::setup();

    let storage = Arc::new(BrokenReads {
        inner: MemoryStorage::new(Duration::from_secs(5), 10),
    });
    let cache = ValueCache::<u8>::new(
        "test",
        storage,
        Duration::from_secs(5),
        SetErrorPolicy::Propagate,
        None,
    );
    let loader = CountingLoader::default();

    for _ in 0..2 {
        let result = cache
            .get_and_load("k", || loader.load(Duration::ZERO, Ok(1u8)))
            .await;
        assert_eq!(result.unwrap(), 1);
    }
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_loader_interrupts_waiters() {
    keyflight_test::setup();

    let cache = memory_cache::<u32>(Duration::from_secs(5));

    let result = cache
        .get_and_load("k", || async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if true {
                panic!("loader exploded");
            }
            Ok::<_, &'static str>(1)
        })
        .await;
    assert!(matches!(result, Err(CacheError::Interrupted { .. })));

    // the computation was cleaned up, the key can be loaded again
    let result = cache
        .get_and_load("k", || async { Ok::<_, &'static str>(2) })
        .await;
    assert_eq!(result.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_noop_cache_always_loads() {
    keyflight_test::setup();

    let cache = NoopCache::<u32>::new();
    let loader = CountingLoader::default();

    for expected in [1, 2, 3] {
        let result = Cache::get_and_load(&cache, "k", || {
            loader.load(Duration::ZERO, Ok(expected))
        })
        .await;
        assert_eq!(result.unwrap(), expected);
    }
    assert_eq!(loader.calls(), 3);

    let result = Cache::get_and_load(&cache, "k", || loader.load(Duration::ZERO, Err("nope")))
        .await;
    assert!(matches!(result, Err(CacheError::Load { .. })));
}
