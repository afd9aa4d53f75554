//! # Migration Registry
//!
//! Definitions known to the process, keyed by identity and listed in
//! namespace then name order.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::definition::Migration;
use super::errors::{MigrationError, MigrationResult};
use super::key::{MigrationId, Partition};

/// Registered migration definitions
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    migrations: BTreeMap<MigrationId, Arc<Migration>>,
    /// Configured partitions; the first is the default
    partitions: Vec<Partition>,
}

impl MigrationRegistry {
    /// Create an empty registry over the configured partitions
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self {
            migrations: BTreeMap::new(),
            partitions,
        }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn default_partition(&self) -> Option<&Partition> {
        self.partitions.first()
    }

    pub fn is_configured(&self, partition: &Partition) -> bool {
        self.partitions.contains(partition)
    }

    /// Partitions `migration` may run on, in configured order
    pub fn partitions_for(&self, migration: &Migration) -> Vec<Partition> {
        self.partitions
            .iter()
            .filter(|p| migration.config().allows(p))
            .cloned()
            .collect()
    }

    /// Register a definition.
    ///
    /// Rejects duplicate keys and allowed partitions that are not configured.
    pub fn register(&mut self, migration: Migration) -> MigrationResult<Arc<Migration>> {
        let id = migration.id().clone();
        if self.migrations.contains_key(&id) {
            return Err(MigrationError::DuplicateMigration { key: id.key() });
        }

        if let Some(allowed) = &migration.config().allowed_partitions {
            for partition in allowed {
                if !self.is_configured(partition) {
                    return Err(MigrationError::InvalidPartition {
                        partition: partition.to_string(),
                        reason: format!(
                            "allowed for migration '{}' but not a configured partition",
                            id
                        ),
                    });
                }
            }
        }

        let migration = Arc::new(migration);
        self.migrations.insert(id, migration.clone());
        Ok(migration)
    }

    /// Look up by `namespace:name` key
    pub fn get(&self, key: &str) -> Option<Arc<Migration>> {
        let id = MigrationId::parse(key).ok()?;
        self.migrations.get(&id).cloned()
    }

    pub fn get_or_err(&self, key: &str) -> MigrationResult<Arc<Migration>> {
        self.get(key).ok_or_else(|| MigrationError::MigrationNotFound {
            key: key.to_string(),
        })
    }

    /// All definitions, ordered by namespace then name
    pub fn all(&self) -> Vec<Arc<Migration>> {
        self.migrations.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Fail unless `migration` may run on `partition`
    pub fn check_can_run_on_partition(
        &self,
        migration: &Migration,
        partition: &Partition,
    ) -> MigrationResult<()> {
        if !self.is_configured(partition) {
            return Err(MigrationError::InvalidPartition {
                partition: partition.to_string(),
                reason: "not a configured partition".to_string(),
            });
        }
        if !migration.config().allows(partition) {
            return Err(MigrationError::InvalidPartition {
                partition: partition.to_string(),
                reason: format!("migration '{}' is not allowed to run here", migration.id()),
            });
        }
        Ok(())
    }
}
