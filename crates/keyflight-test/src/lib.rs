//! Helpers for testing the keyflight crates.
//!
//! This crate contains:
//!
//!  - Tracing setup for tests via [`setup`].

use tracing_subscriber::{EnvFilter, fmt};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the keyflight crates and mutes all
///    other logs (such as hickory or moka).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("keyflight_service=trace,keyflight=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}
