//! Operator CLI
//!
//! All output is JSON on stdout. Failures are reported as
//! `{"error": {"code": ..., "message": ...}}` with exit code 1.

pub mod args;
pub mod commands;
pub mod errors;
pub mod io;

pub use commands::{execute, run};
pub use errors::{CliError, CliErrorCode, CliResult};
