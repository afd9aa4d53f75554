//! # Migration Identity
//!
//! A migration is identified by `(namespace, name)`; its key is
//! `namespace:name`. The key does not embed the partition. Every store and
//! cache operation takes the partition as a separate argument, so the same
//! migration has independent state per partition.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::{MigrationError, MigrationResult};

const KEY_SEPARATOR: char = ':';

fn namespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").expect("valid namespace regex"))
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{1,5}_[a-z0-9_]+$").expect("valid name regex"))
}

/// Stable `(namespace, name)` identity of a migration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationId {
    namespace: String,
    name: String,
}

impl MigrationId {
    /// Create an identity, validating both parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> MigrationResult<Self> {
        let namespace = namespace.into();
        let name = name.into();

        if !namespace_pattern().is_match(&namespace) {
            return Err(MigrationError::InvalidIdentifier {
                value: namespace,
                reason: "Namespace must contain only lowercase letters, digits and underscores"
                    .to_string(),
            });
        }

        if !name_pattern().is_match(&name) {
            return Err(MigrationError::InvalidIdentifier {
                value: name,
                reason: "Name must look like '0001_description' (1-5 digits, underscore, \
                         lowercase letters, digits and underscores)"
                    .to_string(),
            });
        }

        Ok(Self { namespace, name })
    }

    /// Key for a `(namespace, name)` pair
    pub fn key_from_pair(namespace: &str, name: &str) -> MigrationResult<String> {
        Ok(Self::new(namespace, name)?.key())
    }

    /// Parse a `namespace:name` key back into its parts
    pub fn parse(key: &str) -> MigrationResult<Self> {
        let (namespace, name) =
            key.split_once(KEY_SEPARATOR)
                .ok_or_else(|| MigrationError::InvalidIdentifier {
                    value: key.to_string(),
                    reason: "Key must have the form 'namespace:name'".to_string(),
                })?;
        Self::new(namespace, name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `namespace:name` key
    pub fn key(&self) -> String {
        format!("{}{}{}", self.namespace, KEY_SEPARATOR, self.name)
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, KEY_SEPARATOR, self.name)
    }
}

impl FromStr for MigrationId {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An independent data domain with its own migration records
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partition(String);

impl Partition {
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Partition {
    fn from(alias: &str) -> Self {
        Self::new(alias)
    }
}
