use futures::future::BoxFuture;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;

use crate::BoxError;

/// A single DNS SRV answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrvRecord {
    /// Host name of the target, without the trailing dot.
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Looks up SRV records.
pub trait SrvResolver: Send + Sync + 'static {
    /// Resolves the records of `_{service}._{proto}.{name}`.
    fn lookup_srv(
        &self,
        service: &str,
        proto: &str,
        name: &str,
    ) -> BoxFuture<'static, Result<Vec<SrvRecord>, BoxError>>;
}

/// Resolves SRV records through DNS.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

impl DnsResolver {
    /// Uses the resolvers configured for the system, usually through `/etc/resolv.conf`.
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }

    pub fn new(config: ResolverConfig, options: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, options),
        }
    }
}

fn srv_query(service: &str, proto: &str, name: &str) -> String {
    format!("_{service}._{proto}.{name}")
}

impl SrvResolver for DnsResolver {
    fn lookup_srv(
        &self,
        service: &str,
        proto: &str,
        name: &str,
    ) -> BoxFuture<'static, Result<Vec<SrvRecord>, BoxError>> {
        let resolver = self.resolver.clone();
        let query = srv_query(service, proto, name);

        Box::pin(async move {
            tracing::debug!(query, "Looking up SRV records");
            let lookup = resolver.srv_lookup(query).await?;
            let records = lookup
                .iter()
                .map(|srv| SrvRecord {
                    target: srv.target().to_utf8().trim_end_matches('.').to_owned(),
                    port: srv.port(),
                    priority: srv.priority(),
                    weight: srv.weight(),
                })
                .collect();
            Ok(records)
        })
    }
}
