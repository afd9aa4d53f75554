//! CLI errors
//!
//! Every failure is reported as a JSON object with a stable `code` and a
//! human-readable `message`.

use thiserror::Error;

use crate::config::ConfigError;
use crate::migrations::{MigrationError, StoreError};

/// Result type for CLI commands
pub type CliResult<T> = Result<T, CliError>;

/// Category of a CLI failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Config file missing, unreadable or invalid
    ConfigError,
    /// Mutating command run without --yes
    ConfirmationRequired,
    /// Record store could not be opened or used
    StoreError,
    /// Rejected by the lifecycle engine
    MigrationError,
    /// Output could not be written
    IoError,
}

/// A failed CLI command
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CliError {
    code: CliErrorCode,
    /// Specific code reported to the operator
    error_code: &'static str,
    message: String,
}

impl CliError {
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn error_code(&self) -> &'static str {
        self.error_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self {
            code: CliErrorCode::ConfigError,
            error_code: "CONFIG_ERROR",
            message: message.into(),
        }
    }

    pub fn confirmation_required(action: &str) -> Self {
        Self {
            code: CliErrorCode::ConfirmationRequired,
            error_code: "CONFIRMATION_REQUIRED",
            message: format!("Refusing to {} without --yes", action),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self {
            code: CliErrorCode::IoError,
            error_code: "IO_ERROR",
            message: message.into(),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self {
            code: CliErrorCode::ConfigError,
            error_code: err.error_code(),
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        Self {
            code: CliErrorCode::StoreError,
            error_code: "STORE_ERROR",
            message: err.to_string(),
        }
    }
}

impl From<MigrationError> for CliError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Store(store) => store.into(),
            other => Self {
                code: CliErrorCode::MigrationError,
                error_code: other.error_code(),
                message: other.to_string(),
            },
        }
    }
}
