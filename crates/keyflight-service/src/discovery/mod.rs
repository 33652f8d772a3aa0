//! Service discovery through DNS SRV records.
//!
//! Lookups go through a [`ValueCache`], so that bursts of concurrent requests for the same service
//! result in a single DNS query, and the answer is reused for a few seconds.

use std::sync::Arc;

use futures::future::BoxFuture;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::caching::{Cache, CacheError, MemoryStorage, SetErrorPolicy, ValueCache};
use crate::config::DiscoveryCacheConfig;

mod resolver;

pub use resolver::{DnsResolver, SrvRecord, SrvResolver};

/// The protocol all services are looked up under.
const SRV_PROTO: &str = "tcp";

/// Controls how services are located.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// The DNS domain services are registered under, for example `service.consul`.
    pub host_suffix: String,
    /// Port of the HTTP proxy in front of all services.
    pub proxy_port: u16,
    /// Whether to talk to the proxy through TLS.
    pub use_tls: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host_suffix: "service.consul".into(),
            proxy_port: 80,
            use_tls: false,
        }
    }
}

/// An error locating a service.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("SRV lookup for ({name} - {suffix}) failed")]
    Lookup {
        name: String,
        suffix: String,
        #[source]
        source: CacheError,
    },
    #[error("SRV lookup for ({name} - {suffix}) returned no addresses")]
    NoAddresses { name: String, suffix: String },
    #[error("invalid service URL")]
    InvalidUrl(#[from] url::ParseError),
}

/// Locates services by their logical name.
pub trait Finder: Send + Sync {
    /// Returns the URL under which the service is reachable through the proxy.
    ///
    /// The URL is normalized, so a port that is the default for the scheme (80 for `http`, 443
    /// for `https`) does not show up in it.
    fn find_service(&self, name: &str) -> Result<Url, DiscoveryError>;

    /// Resolves one `(host, port)` pair the service is listening on.
    fn find_host_port<'a>(&'a self, name: &'a str)
    -> BoxFuture<'a, Result<(String, u16), DiscoveryError>>;
}

/// A [`Finder`] resolving SRV records, with the answers cached in `C`.
pub struct SrvFinder<C = ValueCache<Vec<SrvRecord>>> {
    config: DiscoveryConfig,
    resolver: Arc<dyn SrvResolver>,
    cache: C,
}

impl<C> std::fmt::Debug for SrvFinder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrvFinder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SrvFinder {
    /// Creates a finder caching SRV answers in memory, as configured by `cache_config`.
    pub fn new(
        config: DiscoveryConfig,
        cache_config: &DiscoveryCacheConfig,
        resolver: Arc<dyn SrvResolver>,
    ) -> Self {
        let storage = Arc::new(MemoryStorage::new(cache_config.ttl, cache_config.capacity));
        let cache = ValueCache::new(
            "discovery",
            storage,
            cache_config.ttl,
            SetErrorPolicy::from_ignore_flag(cache_config.ignore_set_errors),
            None,
        );
        Self::with_cache(config, resolver, cache)
    }
}

impl<C> SrvFinder<C>
where
    C: Cache<Vec<SrvRecord>>,
{
    pub fn with_cache(config: DiscoveryConfig, resolver: Arc<dyn SrvResolver>, cache: C) -> Self {
        Self {
            config,
            resolver,
            cache,
        }
    }

    async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>, CacheError> {
        let resolver = Arc::clone(&self.resolver);
        let service = name.to_owned();
        let suffix = self.config.host_suffix.clone();

        self.cache
            .get_and_load(name, move || async move {
                resolver.lookup_srv(&service, SRV_PROTO, &suffix).await
            })
            .await
    }
}

impl<C> Finder for SrvFinder<C>
where
    C: Cache<Vec<SrvRecord>>,
{
    fn find_service(&self, name: &str) -> Result<Url, DiscoveryError> {
        let scheme = if self.config.use_tls { "https" } else { "http" };
        let mut url = Url::parse(&format!(
            "{scheme}://proxy.{}:{}",
            self.config.host_suffix, self.config.proxy_port
        ))?;
        url.set_path(name);
        Ok(url)
    }

    fn find_host_port<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(String, u16), DiscoveryError>> {
        Box::pin(async move {
            let suffix = &self.config.host_suffix;
            let records = self
                .lookup(name)
                .await
                .map_err(|source| DiscoveryError::Lookup {
                    name: name.to_owned(),
                    suffix: suffix.clone(),
                    source,
                })?;

            let record = records
                .choose(&mut rand::rng())
                .ok_or_else(|| DiscoveryError::NoAddresses {
                    name: name.to_owned(),
                    suffix: suffix.clone(),
                })?;

            tracing::trace!(service = name, target = %record.target, port = record.port, "Resolved service");
            Ok((record.target.clone(), record.port))
        })
    }
}
