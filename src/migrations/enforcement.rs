//! Guards for code that must not run before a migration has been applied.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::errors::{MigrationError, MigrationResult};
use super::key::Partition;
use super::lifecycle::Lifecycle;
use super::registry::MigrationRegistry;

/// Checks that migrations are applied.
///
/// Applied is a one-way state for a given record, so positive answers are
/// remembered until the record is deleted; a negative answer is re-read
/// every time.
pub struct Enforcer {
    registry: Arc<MigrationRegistry>,
    lifecycle: Arc<Lifecycle>,
    applied: Mutex<HashSet<(String, Partition)>>,
}

impl Enforcer {
    pub fn new(registry: Arc<MigrationRegistry>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            registry,
            lifecycle,
            applied: Mutex::new(HashSet::new()),
        }
    }

    fn remembered(&self, key: &str, partition: &Partition) -> bool {
        self.applied
            .lock()
            .map(|applied| applied.contains(&(key.to_string(), partition.clone())))
            .unwrap_or(false)
    }

    fn remember(&self, key: &str, partition: &Partition) {
        if let Ok(mut applied) = self.applied.lock() {
            applied.insert((key.to_string(), partition.clone()));
        }
    }

    /// Drop the remembered answer for a deleted record
    pub fn forget(&self, key: &str, partition: &Partition) {
        if let Ok(mut applied) = self.applied.lock() {
            applied.remove(&(key.to_string(), partition.clone()));
        }
    }

    /// Fail with `RequiredMigrationNotApplied` unless `key` is applied on every
    /// partition in `partitions`, or on every partition it is allowed on when
    /// `partitions` is `None`
    pub fn require_applied(
        &self,
        key: &str,
        partitions: Option<&[Partition]>,
    ) -> MigrationResult<()> {
        let migration = self.registry.get_or_err(key)?;
        let partitions = match partitions {
            Some(partitions) => partitions.to_vec(),
            None => self.registry.partitions_for(&migration),
        };

        for partition in &partitions {
            if self.remembered(key, partition) {
                continue;
            }
            let applied = self
                .lifecycle
                .record(migration.id(), partition)?
                .map_or(false, |record| record.is_applied);
            if !applied {
                return Err(MigrationError::RequiredMigrationNotApplied {
                    key: key.to_string(),
                    partition: partition.to_string(),
                });
            }
            self.remember(key, partition);
        }
        Ok(())
    }
}
