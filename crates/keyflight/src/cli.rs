//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyflight_service::config::Config;
use keyflight_service::discovery::{DnsResolver, Finder, SrvFinder};
use keyflight_service::metrics;

use crate::logging;

/// Keyflight commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve a service to one `host:port` it is listening on.
    Resolve {
        /// Logical name of the service.
        name: String,
    },

    /// Print the proxy URL of a service.
    Url {
        /// Logical name of the service.
        name: String,
    },

    /// Print the connection string of the configured database, with the password masked.
    Dsn,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: Neither the sentry transport nor the runtime have been started yet, so no other
    // threads exist.
    unsafe { logging::init_logging(&config) };

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config
            .sentry_dsn
            .as_deref()
            .map(str::parse)
            .transpose()
            .context("invalid sentry DSN")?,
        release: sentry::release_name!(),
        ..Default::default()
    });

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(config, cli.command))
}

async fn run(config: Config, command: Command) -> Result<()> {
    let resolver = DnsResolver::from_system_conf().context("failed to set up DNS resolver")?;
    let finder = SrvFinder::new(
        config.discovery.clone(),
        &config.caches.discovery,
        Arc::new(resolver),
    );

    match command {
        Command::Resolve { name } => {
            let (host, port) = finder.find_host_port(&name).await?;
            println!("{host}:{port}");
        }
        Command::Url { name } => {
            println!("{}", finder.find_service(&name)?);
        }
        Command::Dsn => {
            let database = &config.database;
            anyhow::ensure!(!database.name.is_empty(), "no database configured");
            let (host, port) = finder
                .find_host_port(&database.service_name())
                .await
                .context("could not find connection string")?;
            println!("{}", database.redacted_connection_string(&host, port));
        }
    }

    Ok(())
}
