//! massmigrate operator CLI

use massmigrate::cli::{self, io::write_error};
use tracing_subscriber::EnvFilter;

fn main() {
    // Logs go to stderr; stdout carries the JSON response
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = cli::run() {
        if write_error(&err).is_err() {
            eprintln!("{}: {}", err.error_code(), err);
        }
        std::process::exit(1);
    }
}
