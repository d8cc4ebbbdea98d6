//! Tracing setup for the binary.
//!
//! Filtering follows `RUST_LOG`; without it the host logs at `info`, or at
//! `debug` for its own modules when `--verbose` is passed.

use tracing_subscriber::EnvFilter;

pub fn init(verbose: bool) {
    let default_directive = if verbose {
        concat!("info,", env!("CARGO_PKG_NAME"), "=debug")
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
