//! # Migration Lifecycle
//!
//! `NOT_STARTED -> RUNNING -> {APPLIED, ERRORED}`.
//!
//! Only [`Lifecycle::start`] creates a record, through the store's conditional
//! create, so two racing starters produce exactly one record. Error and
//! applied flags are set inside store transactions that first check the
//! attempt token, so a unit from a superseded attempt can never touch the
//! record of the attempt that replaced it. Each mutation writes the resulting
//! record through to the hot-path cache.
//!
//! Records are deleted only by operator action.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::cache::RecordCache;
use super::definition::MigrationConfig;
use super::errors::{MigrationError, MigrationResult, StoreError};
use super::key::{MigrationId, Partition};
use super::retry::RetryPolicy;
use super::state::MigrationRecord;
use super::store::RecordStore;

/// Result of a guarded flag update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The flag was set by this call
    Updated,
    /// The flag was already set
    Unchanged,
    /// The attempt has errored; applied was not set
    Errored,
    /// The record belongs to a different attempt
    Stale,
    /// No record exists
    Missing,
}

/// Lifecycle engine over a record store
pub struct Lifecycle {
    store: Arc<dyn RecordStore>,
    cache: RecordCache,
    retry: RetryPolicy,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn RecordStore>, cache: RecordCache, retry: RetryPolicy) -> Self {
        Self {
            store,
            cache,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    /// Current record, read from the store
    pub fn record(
        &self,
        id: &MigrationId,
        partition: &Partition,
    ) -> MigrationResult<Option<MigrationRecord>> {
        Ok(self.store.get(partition, &id.key())?)
    }

    /// Current record, served from the hot-path cache
    pub fn cached_record(
        &self,
        key: &str,
        partition: &Partition,
    ) -> MigrationResult<Option<MigrationRecord>> {
        Ok(self.cache.get_record(key, partition)?)
    }

    /// Whether no record exists.
    ///
    /// Advisory only: [`Lifecycle::start`] re-checks atomically.
    pub fn can_start(&self, id: &MigrationId, partition: &Partition) -> MigrationResult<bool> {
        Ok(self.record(id, partition)?.is_none())
    }

    /// Create the record for a new attempt and return its token
    pub fn start(&self, id: &MigrationId, partition: &Partition) -> MigrationResult<Uuid> {
        let mut record = MigrationRecord::new_attempt(id.key(), partition.clone());
        record.initiated_by = Some(whoami::username());
        let token = record.attempt_token;

        match self.store.create(record.clone()) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(MigrationError::AlreadyStarted {
                    key: id.key(),
                    partition: partition.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.cache.refresh(&record);
        info!(migration = %id, partition = %partition, attempt = %token, "migration started");
        Ok(token)
    }

    /// Flag the attempt `token` as errored.
    ///
    /// Transient store failures are retried with backoff; losing this write
    /// would leave the migration looking healthy forever.
    pub fn mark_errored(
        &self,
        id: &MigrationId,
        partition: &Partition,
        token: Uuid,
        reason: &str,
    ) -> MigrationResult<MarkOutcome> {
        let key = id.key();
        let (record, outcome) = self.retry.run("mark_errored", || {
            let mut outcome = MarkOutcome::Missing;
            let record = self.store.update(partition, &key, &mut |record| {
                if record.attempt_token != token {
                    outcome = MarkOutcome::Stale;
                    return false;
                }
                if record.has_error && record.last_error == reason {
                    outcome = MarkOutcome::Unchanged;
                    return false;
                }
                record.mark_errored(reason);
                outcome = MarkOutcome::Updated;
                true
            })?;
            Ok((record, outcome))
        })?;

        if let Some(record) = &record {
            self.cache.refresh(record);
        }

        match outcome {
            MarkOutcome::Updated => {
                warn!(migration = %id, partition = %partition, attempt = %token, error = reason, "migration marked as errored");
            }
            MarkOutcome::Stale => {
                warn!(migration = %id, partition = %partition, attempt = %token, "not marking errored: record belongs to a newer attempt");
            }
            MarkOutcome::Missing => {
                warn!(migration = %id, partition = %partition, attempt = %token, "not marking errored: record no longer exists");
            }
            MarkOutcome::Unchanged | MarkOutcome::Errored => {}
        }
        Ok(outcome)
    }

    /// Flag the attempt `token` as applied.
    ///
    /// Safe to call repeatedly and concurrently. Never sets applied on an
    /// errored attempt.
    pub fn mark_applied(
        &self,
        id: &MigrationId,
        partition: &Partition,
        token: Uuid,
    ) -> MigrationResult<MarkOutcome> {
        let key = id.key();
        let (record, outcome) = self.retry.run("mark_applied", || {
            let mut outcome = MarkOutcome::Missing;
            let record = self.store.update(partition, &key, &mut |record| {
                if record.attempt_token != token {
                    outcome = MarkOutcome::Stale;
                    return false;
                }
                if record.has_error {
                    outcome = MarkOutcome::Errored;
                    return false;
                }
                if record.is_applied {
                    outcome = MarkOutcome::Unchanged;
                    return false;
                }
                record.mark_applied();
                outcome = MarkOutcome::Updated;
                true
            })?;
            Ok((record, outcome))
        })?;

        if let Some(record) = &record {
            self.cache.refresh(record);
        }

        match outcome {
            MarkOutcome::Updated => {
                info!(migration = %id, partition = %partition, attempt = %token, "migration finished, marked as applied");
            }
            MarkOutcome::Unchanged => {
                warn!(migration = %id, partition = %partition, "migration is already marked as applied");
            }
            MarkOutcome::Errored => {
                warn!(migration = %id, partition = %partition, attempt = %token, "not marking applied: attempt has errored");
            }
            MarkOutcome::Stale => {
                warn!(migration = %id, partition = %partition, attempt = %token, "not marking applied: record belongs to a newer attempt");
            }
            MarkOutcome::Missing => {
                warn!(migration = %id, partition = %partition, attempt = %token, "not marking applied: record no longer exists");
            }
        }
        Ok(outcome)
    }

    /// Fail unless every dependency is applied on `partition`.
    ///
    /// Creates nothing; call before [`Lifecycle::start`].
    pub fn check_dependencies(
        &self,
        config: &MigrationConfig,
        partition: &Partition,
    ) -> MigrationResult<()> {
        if config.dependencies.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = config.dependencies.iter().map(MigrationId::key).collect();
        let records = self.store.get_many(partition, &keys)?;

        for key in keys {
            let applied = records.get(&key).map_or(false, |r| r.is_applied);
            if !applied {
                return Err(MigrationError::DependencyNotApplied {
                    key: config.id.key(),
                    dependency: key,
                    partition: partition.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Operator action: remove the record so the migration can be retried.
    ///
    /// Refuses a running attempt unless `force` is set.
    pub fn delete(
        &self,
        id: &MigrationId,
        partition: &Partition,
        force: bool,
    ) -> MigrationResult<MigrationRecord> {
        let record =
            self.record(id, partition)?
                .ok_or_else(|| MigrationError::RecordNotFound {
                    key: id.key(),
                    partition: partition.to_string(),
                })?;

        if record.in_progress() && !force {
            return Err(MigrationError::AttemptInProgress {
                key: id.key(),
                partition: partition.to_string(),
            });
        }

        self.store.delete(partition, &id.key())?;
        self.cache.invalidate(&id.key(), partition);
        info!(migration = %id, partition = %partition, attempt = %record.attempt_token, "migration record deleted");
        Ok(record)
    }

    /// Operator action: record the migration as applied without running it
    pub fn fake_applied(
        &self,
        id: &MigrationId,
        partition: &Partition,
    ) -> MigrationResult<MigrationRecord> {
        let mut record = MigrationRecord::faked(id.key(), partition.clone());
        record.initiated_by = Some(whoami::username());

        match self.store.create(record.clone()) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(MigrationError::AlreadyStarted {
                    key: id.key(),
                    partition: partition.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.cache.refresh(&record);
        info!(migration = %id, partition = %partition, "migration faked as applied");
        Ok(record)
    }
}
