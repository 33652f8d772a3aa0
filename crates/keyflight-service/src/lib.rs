//! Keyed resource caching for services that talk to discovered backends.
//!
//! The crate provides two flavours of "initialize at most once per key":
//!
//! - [`caching::ValueCache`] coalesces concurrent loads of short-lived values and keeps the
//!   results in a pluggable [`caching::Storage`] backend for a fixed TTL.
//! - [`pool::ResourcePool`] lazily creates long-lived handles keyed by a signature and keeps
//!   them for the lifetime of the pool.
//!
//! [`discovery`] and [`provision`] are the two consumers built on top of them.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod discovery;
pub mod logging;
pub mod pool;
pub mod provision;
pub mod utils;

/// Boxed error type accepted from loaders, creators and storage backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[cfg(test)]
pub(crate) use tokio::time;

#[cfg(not(test))]
pub(crate) use std::time;
