//! # Configuration
//!
//! Deployment settings, loaded from TOML and validated up front. Validation
//! collects every problem before failing so an operator can fix a config
//! file in one pass.
//!
//! ```toml
//! partitions = ["default", "analytics"]
//! default_backend = "tasks"
//! task_queue = "migrations"
//! record_cache_ttl_secs = 60
//! shard_count = 32
//! state_file = "/var/lib/massmigrate/records.json"
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 100
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::migrations::backend::DEFAULT_SHARD_COUNT;
use crate::migrations::key::Partition;
use crate::migrations::retry::RetryPolicy;

/// Largest accepted shard count
pub const MAX_SHARD_COUNT: usize = 1024;

/// Longest accepted record cache lifetime, one day
pub const MAX_RECORD_CACHE_TTL_SECS: u64 = 86_400;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// One invalid field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid configuration for '{}': {} (value: {})",
            self.field, self.message, self.value
        )
    }
}

/// Configuration failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    Parse { message: String },

    #[error("Invalid configuration:\n{}", format_validation_errors(.errors))]
    Invalid { errors: Vec<ConfigValidationError> },
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "CONFIG_IO_ERROR",
            Self::Parse { .. } => "CONFIG_PARSE_ERROR",
            Self::Invalid { .. } => "CONFIG_INVALID",
        }
    }
}

/// Format validation errors for display
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collects validation errors across fields
#[derive(Debug, Default)]
pub struct ConfigValidator {
    errors: Vec<ConfigValidationError>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn error(&mut self, field: &str, value: impl fmt::Display, message: &str) {
        self.errors.push(ConfigValidationError {
            field: field.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        });
    }

    /// Validate positive integer
    pub fn validate_positive(&mut self, field: &str, value: u64) -> &mut Self {
        if value == 0 {
            self.error(field, value, "Value must be positive");
        }
        self
    }

    /// Validate range (inclusive)
    pub fn validate_range(&mut self, field: &str, value: u64, min: u64, max: u64) -> &mut Self {
        if value < min || value > max {
            self.error(field, value, &format!("Value must be between {} and {}", min, max));
        }
        self
    }

    /// Validate non-empty string
    pub fn validate_non_empty(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.error(field, value, "Value cannot be empty");
        }
        self
    }

    /// Validate a list has at least one entry
    pub fn validate_not_empty_list<T>(&mut self, field: &str, values: &[T]) -> &mut Self {
        if values.is_empty() {
            self.error(field, "[]", "At least one entry is required");
        }
        self
    }

    /// Validate list entries are distinct
    pub fn validate_unique(&mut self, field: &str, values: &[String]) -> &mut Self {
        for (i, value) in values.iter().enumerate() {
            if values[..i].contains(value) {
                self.error(field, value, "Duplicate entry");
            }
        }
        self
    }

    /// Validate a multiplier is a finite value of at least 1
    pub fn validate_multiplier(&mut self, field: &str, value: f64) -> &mut Self {
        if !value.is_finite() || value < 1.0 {
            self.error(field, value, "Multiplier must be at least 1.0");
        }
        self
    }

    /// Validate an optional string is non-empty when present
    pub fn validate_optional_non_empty(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.validate_non_empty(field, value);
        }
        self
    }

    /// Finish validation and return result
    pub fn finish(self) -> ConfigResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                errors: self.errors,
            })
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Mass migration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MassMigrationConfig {
    /// Configured data partitions; the first is the default
    pub partitions: Vec<String>,

    /// Backend used by migrations without an override
    pub default_backend: Option<String>,

    /// Queue used by migrations without an override
    pub task_queue: Option<String>,

    /// TTL of the hot-path record cache
    pub record_cache_ttl_secs: u64,

    /// Number of key ranges a mapper is split into
    pub shard_count: usize,

    pub retry: RetryPolicy,

    /// State file of the file-backed record store
    pub state_file: Option<PathBuf>,
}

impl Default for MassMigrationConfig {
    fn default() -> Self {
        Self {
            partitions: vec!["default".to_string()],
            default_backend: None,
            task_queue: None,
            record_cache_ttl_secs: 60,
            shard_count: DEFAULT_SHARD_COUNT,
            retry: RetryPolicy::default(),
            state_file: None,
        }
    }
}

impl MassMigrationConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut v = ConfigValidator::new();
        v.validate_not_empty_list("partitions", &self.partitions)
            .validate_unique("partitions", &self.partitions)
            .validate_optional_non_empty("default_backend", self.default_backend.as_deref())
            .validate_optional_non_empty("task_queue", self.task_queue.as_deref())
            .validate_range(
                "record_cache_ttl_secs",
                self.record_cache_ttl_secs,
                1,
                MAX_RECORD_CACHE_TTL_SECS,
            )
            .validate_range("shard_count", self.shard_count as u64, 1, MAX_SHARD_COUNT as u64)
            .validate_positive("retry.max_attempts", self.retry.max_attempts as u64)
            .validate_multiplier("retry.backoff_multiplier", self.retry.backoff_multiplier);

        for partition in &self.partitions {
            v.validate_non_empty("partitions", partition);
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            v.error(
                "retry.initial_delay_ms",
                self.retry.initial_delay_ms,
                "Initial delay must not exceed max_delay_ms",
            );
        }
        v.finish()
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.partitions.iter().map(Partition::new).collect()
    }

    pub fn default_partition(&self) -> Option<Partition> {
        self.partitions.first().map(Partition::new)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.record_cache_ttl_secs)
    }

    /// Resolve `partition`, defaulting to the first configured one, and
    /// check it is configured
    pub fn resolve_partition(&self, partition: Option<&str>) -> ConfigResult<Partition> {
        let name = match partition {
            Some(name) => name,
            None => self.partitions.first().map(String::as_str).unwrap_or_default(),
        };
        if !self.partitions.iter().any(|p| p == name) {
            return Err(ConfigError::Invalid {
                errors: vec![ConfigValidationError {
                    field: "partition".to_string(),
                    value: name.to_string(),
                    message: "Not a configured partition".to_string(),
                }],
            });
        }
        Ok(Partition::new(name))
    }
}
