//! Keyflight.
//!
//! A command line front-end to the keyflight service layer. It locates services through DNS SRV
//! records and prints their proxy URLs, resolved addresses and database connection strings.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

#[cfg(test)]
use keyflight_test as _;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
