//! JSON output for CLI commands

use std::io::Write;

use serde_json::{json, Value};

use super::errors::{CliError, CliResult};

/// Write one JSON value as a line
pub fn write_json(out: &mut impl Write, value: &Value) -> CliResult<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| CliError::io_error(format!("Failed to encode output: {}", e)))?;
    writeln!(out, "{}", line).map_err(|e| CliError::io_error(format!("Failed to write output: {}", e)))
}

/// Write a successful response to stdout
pub fn write_response(value: Value) -> CliResult<()> {
    write_json(&mut std::io::stdout().lock(), &value)
}

/// JSON body of an error response
pub fn error_body(err: &CliError) -> Value {
    json!({
        "error": {
            "code": err.error_code(),
            "message": err.message(),
        }
    })
}

/// Write an error response to stdout
pub fn write_error(err: &CliError) -> CliResult<()> {
    write_json(&mut std::io::stdout().lock(), &error_body(err))
}
