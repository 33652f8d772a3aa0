//! Shares database handles across the process.
//!
//! The database address is located through a [`Finder`] on every request. The derived connection
//! string, together with the driver name, forms the signature under which the handle is kept in
//! a [`ResourcePool`]. When the database moves, the new address yields a new signature and thus a
//! new handle; handles for the old address are kept around.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;

use crate::BoxError;
use crate::discovery::{DiscoveryError, Finder};
use crate::pool::{PoolError, PoolLimits, ResourcePool};

/// Connection settings of a database.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Name of the database. The database service is located as `{name}-db`.
    pub name: String,
    /// Name of the driver used to open handles.
    pub driver: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
    /// Limits applied to every opened handle.
    #[serde(flatten)]
    pub limits: PoolLimits,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: "postgres".into(),
            user: String::new(),
            password: String::new(),
            ssl_mode: "disable".into(),
            limits: PoolLimits::default(),
        }
    }
}

impl DatabaseConfig {
    /// The service name the database is registered under.
    pub fn service_name(&self) -> String {
        format!("{}-db", self.name)
    }

    /// Builds the connection string for a database listening at `host:port`.
    pub fn connection_string(&self, host: &str, port: u16) -> String {
        self.format_connection_string(host, port, &query_escape(&self.password))
    }

    /// Like [`connection_string`](Self::connection_string), but with the password masked.
    pub fn redacted_connection_string(&self, host: &str, port: u16) -> String {
        self.format_connection_string(host, port, "xxx")
    }

    fn format_connection_string(&self, host: &str, port: u16, password: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, password, host, port, self.name, self.ssl_mode
        )
    }
}

/// Escapes a value for use in a URL query.
///
/// Uses `application/x-www-form-urlencoded` rules: spaces become `+`, `*` is kept and `~` is
/// percent-encoded. Connection string parsers decode either form to the same password.
fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Connection counters of an opened handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Utilization {
    pub max_open: u64,
    pub idle: u64,
    pub open: u64,
    pub in_use: u64,
}

/// Opens database handles.
pub trait HandleOpener: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Opens a handle for `connection_string`, sized according to `limits`.
    fn open(
        &self,
        driver: &str,
        connection_string: &str,
        limits: PoolLimits,
    ) -> BoxFuture<'static, Result<Self::Handle, BoxError>>;

    /// Reports the connection counters of `handle`, if the driver keeps any.
    fn utilization(&self, _handle: &Self::Handle) -> Option<Utilization> {
        None
    }
}

/// An error provisioning a database handle.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("could not find connection string for database `{name}`")]
    Discovery {
        name: String,
        #[source]
        source: DiscoveryError,
    },
    #[error("could not get connection for database `{name}`")]
    Connection {
        name: String,
        #[source]
        source: PoolError,
    },
}

/// Hands out shared handles to one database.
pub struct Provisioner<O: HandleOpener> {
    config: DatabaseConfig,
    finder: Arc<dyn Finder>,
    opener: Arc<O>,
    pool: Arc<ResourcePool<O::Handle>>,
}

impl<O: HandleOpener> std::fmt::Debug for Provisioner<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<O: HandleOpener> Provisioner<O> {
    /// Creates a provisioner drawing handles from `pool`.
    ///
    /// The pool may be shared between provisioners, handles are only shared between equal
    /// signatures.
    pub fn new(
        config: DatabaseConfig,
        finder: Arc<dyn Finder>,
        opener: Arc<O>,
        pool: Arc<ResourcePool<O::Handle>>,
    ) -> Self {
        Self {
            config,
            finder,
            opener,
            pool,
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Locates the database and builds its connection string.
    pub async fn connection_string(&self) -> Result<String, ProvisionError> {
        let (host, port) = self
            .finder
            .find_host_port(&self.config.service_name())
            .await
            .map_err(|source| ProvisionError::Discovery {
                name: self.config.name.clone(),
                source,
            })?;
        Ok(self.config.connection_string(&host, port))
    }

    /// Returns the shared handle for the current location of the database.
    pub async fn get_connection(&self) -> Result<Arc<O::Handle>, ProvisionError> {
        let connection_string = self.connection_string().await?;
        let signature = format!("{}|{}", self.config.driver, connection_string);

        let opener = Arc::clone(&self.opener);
        let driver = self.config.driver.clone();
        let handle = self
            .pool
            .get_handle(&signature, move |limits| {
                opener.open(&driver, &connection_string, limits)
            })
            .await
            .map_err(|source| ProvisionError::Connection {
                name: self.config.name.clone(),
                source,
            })?;

        self.report_utilization(&handle);
        Ok(handle)
    }

    fn report_utilization(&self, handle: &O::Handle) {
        let Some(stats) = self.opener.utilization(handle) else {
            return;
        };
        let db_name = self.config.name.as_str();
        metric!(gauge("database.connections.max_open") = stats.max_open, "db_name" => db_name);
        metric!(gauge("database.connections.idle") = stats.idle, "db_name" => db_name);
        metric!(gauge("database.connections.open") = stats.open, "db_name" => db_name);
        metric!(gauge("database.connections.in_use") = stats.in_use, "db_name" => db_name);
    }
}
