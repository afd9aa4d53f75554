//! # Work Units
//!
//! The code that runs inside a scheduled task. A unit never trusts that its
//! attempt is still current: before doing work it consults the migration
//! record (through the hot-path cache for per-item checks) and abandons
//! itself when the record is gone, belongs to another attempt, or has
//! errored.
//!
//! User operation failures are recorded on the migration record and the
//! unit then reports success to its dispatcher, so semantically failed user
//! code is never blindly retried. Only store failures travel back to the
//! dispatcher, as [`TaskError`]s.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::definition::{ItemOperation, SimpleOperation};
use super::errors::{MigrationResult, TaskError};
use super::key::{MigrationId, Partition};
use super::lifecycle::{Lifecycle, MarkOutcome};
use super::range::{KeyRange, MapperItem, RecordSet};

/// Text stored in `last_error` for a user failure
pub(crate) fn describe_failure(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

/// What happened to one mapper item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The user operation ran and succeeded
    Processed,
    /// The migration record no longer exists
    SkippedMissing,
    /// The record belongs to a newer attempt
    SkippedStale,
    /// The attempt has already errored
    SkippedErrored,
    /// The user operation failed and the attempt was marked errored
    Failed,
}

impl ItemOutcome {
    /// Whether the unit should carry on with the next item
    pub fn should_continue(self) -> bool {
        self == Self::Processed
    }
}

/// Check the attempt, then apply `operation` to one item
pub fn process_item(
    lifecycle: &Lifecycle,
    id: &MigrationId,
    partition: &Partition,
    token: Uuid,
    item: &MapperItem,
    operation: &ItemOperation,
) -> MigrationResult<ItemOutcome> {
    let key = id.key();
    let Some(record) = lifecycle.cached_record(&key, partition)? else {
        warn!(migration = %id, partition = %partition, item = %item.key, "migration record missing, skipping");
        return Ok(ItemOutcome::SkippedMissing);
    };
    if record.attempt_token != token {
        debug!(migration = %id, partition = %partition, attempt = %token, "attempt superseded, skipping");
        return Ok(ItemOutcome::SkippedStale);
    }
    if record.has_error {
        debug!(migration = %id, partition = %partition, attempt = %token, "attempt has errored, skipping");
        return Ok(ItemOutcome::SkippedErrored);
    }

    match operation(item, partition) {
        Ok(()) => Ok(ItemOutcome::Processed),
        Err(err) => {
            let reason = describe_failure(&err);
            error!(
                migration = %id,
                partition = %partition,
                attempt = %token,
                item = %item.key,
                error = %reason,
                "operation failed on item"
            );
            lifecycle.mark_errored(id, partition, token, &reason)?;
            Ok(ItemOutcome::Failed)
        }
    }
}

/// Unit that runs the operation of a simple migration.
///
/// The backend starts the attempt before scheduling the unit; redeliveries
/// find the attempt finished and skip.
pub struct SimpleUnit {
    lifecycle: Arc<Lifecycle>,
    id: MigrationId,
    operation: SimpleOperation,
    partition: Partition,
    token: Uuid,
}

impl SimpleUnit {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        id: MigrationId,
        operation: SimpleOperation,
        partition: Partition,
        token: Uuid,
    ) -> Self {
        Self {
            lifecycle,
            id,
            operation,
            partition,
            token,
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn run(&self) -> Result<(), TaskError> {
        let token = self.token;

        // A redelivered unit may find its attempt finished, failed or reset
        let record = self
            .lifecycle
            .record(&self.id, &self.partition)
            .map_err(TaskError::from)?;
        match record {
            Some(record) if record.attempt_token == token && record.in_progress() => {}
            _ => {
                debug!(migration = %self.id, partition = %self.partition, attempt = %token, "attempt no longer running, skipping");
                return Ok(());
            }
        }

        match (self.operation)(&self.partition) {
            Ok(()) => {
                self.lifecycle
                    .mark_applied(&self.id, &self.partition, token)
                    .map_err(TaskError::from)?;
            }
            Err(err) => {
                let reason = describe_failure(&err);
                error!(migration = %self.id, partition = %self.partition, attempt = %token, error = %reason, "migration operation failed");
                self.lifecycle
                    .mark_errored(&self.id, &self.partition, token, &reason)
                    .map_err(TaskError::from)?;
            }
        }
        Ok(())
    }
}

/// Summary of one range unit run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeReport {
    pub processed: usize,
    /// Why the unit stopped early, if it did
    pub stopped_by: Option<ItemOutcome>,
}

/// Unit that applies a mapper's operation to one key range
pub struct RangeUnit {
    lifecycle: Arc<Lifecycle>,
    id: MigrationId,
    partition: Partition,
    token: Uuid,
    record_set: Arc<dyn RecordSet>,
    operation: ItemOperation,
    range: KeyRange,
}

impl RangeUnit {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        id: MigrationId,
        partition: Partition,
        token: Uuid,
        record_set: Arc<dyn RecordSet>,
        operation: ItemOperation,
        range: KeyRange,
    ) -> Self {
        Self {
            lifecycle,
            id,
            partition,
            token,
            record_set,
            operation,
            range,
        }
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    /// Visit the range in key order, stopping at the first item that is not
    /// processed
    pub fn run(&self) -> MigrationResult<RangeReport> {
        let items = self.record_set.fetch(&self.range)?;
        let mut report = RangeReport {
            processed: 0,
            stopped_by: None,
        };

        for item in &items {
            let outcome = process_item(
                &self.lifecycle,
                &self.id,
                &self.partition,
                self.token,
                item,
                &self.operation,
            )?;
            if !outcome.should_continue() {
                report.stopped_by = Some(outcome);
                break;
            }
            report.processed += 1;
        }

        info!(
            migration = %self.id,
            partition = %self.partition,
            range = %self.range,
            processed = report.processed,
            total = items.len(),
            "range unit finished"
        );
        Ok(report)
    }

    /// Run as a dispatched task.
    ///
    /// Transient store failures are handed back for retry. A permanent
    /// failure marks the attempt errored, since the range can never complete.
    pub fn run_task(&self) -> Result<(), TaskError> {
        match self.run() {
            Ok(_) => Ok(()),
            Err(err) => {
                let task_err = TaskError::from(err);
                if let TaskError::Fatal(reason) = &task_err {
                    let reason = format!("range {} failed: {}", self.range, reason);
                    if let Err(e) =
                        self.lifecycle
                            .mark_errored(&self.id, &self.partition, self.token, &reason)
                    {
                        error!(migration = %self.id, partition = %self.partition, error = %e, "could not record range failure");
                    }
                }
                Err(task_err)
            }
        }
    }
}

/// Finalize step of a mapper attempt: mark it applied unless it errored
pub fn finalize(
    lifecycle: &Lifecycle,
    id: &MigrationId,
    partition: &Partition,
    token: Uuid,
) -> Result<MarkOutcome, TaskError> {
    Ok(lifecycle.mark_applied(id, partition, token)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::cache::{RecordCache, TtlCache, DEFAULT_RECORD_CACHE_TTL};
    use crate::migrations::range::{InMemoryRecordSet, ItemKey};
    use crate::migrations::retry::RetryPolicy;
    use crate::migrations::state::MigrationStatus;
    use crate::migrations::store::{InMemoryRecordStore, RecordStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lifecycle() -> (Arc<InMemoryRecordStore>, Arc<Lifecycle>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let cache = RecordCache::new(
            Arc::new(TtlCache::new()),
            store.clone(),
            DEFAULT_RECORD_CACHE_TTL,
        );
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            cache,
            RetryPolicy::immediate(3),
        ));
        (store, lifecycle)
    }

    fn id() -> MigrationId {
        MigrationId::new("app1", "0001_backfill").unwrap()
    }

    fn default() -> Partition {
        Partition::new("default")
    }

    fn counting_op(counter: &Arc<AtomicUsize>) -> ItemOperation {
        let counter = counter.clone();
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn range_unit(
        lifecycle: &Arc<Lifecycle>,
        token: Uuid,
        set: Arc<dyn RecordSet>,
        operation: ItemOperation,
    ) -> RangeUnit {
        RangeUnit::new(
            lifecycle.clone(),
            id(),
            default(),
            token,
            set,
            operation,
            KeyRange::full(),
        )
    }

    fn simple_unit(lifecycle: &Arc<Lifecycle>, operation: SimpleOperation) -> SimpleUnit {
        let token = lifecycle.start(&id(), &default()).unwrap();
        SimpleUnit::new(lifecycle.clone(), id(), operation, default(), token)
    }

    #[test]
    fn test_simple_unit_success() {
        let (_, lifecycle) = lifecycle();
        let unit = simple_unit(&lifecycle, Arc::new(|_| Ok(())));

        unit.run().unwrap();
        let record = lifecycle.record(&id(), &default()).unwrap().unwrap();
        assert_eq!(record.status(), MigrationStatus::Applied);
        assert_eq!(record.attempt_token, unit.token());
    }

    #[test]
    fn test_simple_unit_failure_is_recorded_not_propagated() {
        let (_, lifecycle) = lifecycle();
        let unit = simple_unit(
            &lifecycle,
            Arc::new(|_| Err(anyhow::anyhow!("bad data").context("ValueError"))),
        );

        unit.run().unwrap();
        let record = lifecycle.record(&id(), &default()).unwrap().unwrap();
        assert!(record.has_error);
        assert!(!record.is_applied);
        assert!(record.last_error.contains("bad data"));
        assert!(record.last_error.contains("ValueError"));
    }

    #[test]
    fn test_simple_unit_redelivery_does_not_rerun() {
        let (_, lifecycle) = lifecycle();
        let counter = Arc::new(AtomicUsize::new(0));
        let op_counter = counter.clone();
        let unit = simple_unit(
            &lifecycle,
            Arc::new(move |_| {
                op_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        unit.run().unwrap();
        unit.run().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_simple_unit_of_reset_attempt_skips() {
        let (_, lifecycle) = lifecycle();
        let unit = simple_unit(&lifecycle, Arc::new(|_| panic!("must not run")));
        lifecycle.delete(&id(), &default(), true).unwrap();
        let current = lifecycle.start(&id(), &default()).unwrap();

        unit.run().unwrap();
        let record = lifecycle.record(&id(), &default()).unwrap().unwrap();
        assert_eq!(record.attempt_token, current);
        assert_eq!(record.status(), MigrationStatus::Running);
    }

    #[test]
    fn test_range_unit_processes_everything() {
        let (_, lifecycle) = lifecycle();
        let token = lifecycle.start(&id(), &default()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let set: Arc<dyn RecordSet> = Arc::new(InMemoryRecordSet::sequential(50));

        let report = range_unit(&lifecycle, token, set, counting_op(&counter))
            .run()
            .unwrap();
        assert_eq!(report.processed, 50);
        assert_eq!(report.stopped_by, None);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_range_unit_stops_at_first_failure() {
        let (_, lifecycle) = lifecycle();
        let token = lifecycle.start(&id(), &default()).unwrap();
        let set: Arc<dyn RecordSet> = Arc::new(InMemoryRecordSet::sequential(10));
        let seen = Arc::new(AtomicUsize::new(0));
        let op_seen = seen.clone();
        let operation: ItemOperation = Arc::new(move |item, _| {
            op_seen.fetch_add(1, Ordering::SeqCst);
            if item.key == ItemKey::Int(3) {
                anyhow::bail!("bad data in item 3");
            }
            Ok(())
        });

        let report = range_unit(&lifecycle, token, set, operation).run().unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.stopped_by, Some(ItemOutcome::Failed));
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        let record = lifecycle.record(&id(), &default()).unwrap().unwrap();
        assert!(record.has_error);
        assert!(record.last_error.contains("item 3"));

        // Finalize must not apply an errored attempt
        let outcome = finalize(&lifecycle, &id(), &default(), token).unwrap();
        assert_eq!(outcome, MarkOutcome::Errored);
    }

    #[test]
    fn test_stale_unit_does_not_touch_new_attempt() {
        let (_, lifecycle) = lifecycle();
        let old = lifecycle.start(&id(), &default()).unwrap();
        lifecycle.delete(&id(), &default(), true).unwrap();
        let new = lifecycle.start(&id(), &default()).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let set: Arc<dyn RecordSet> = Arc::new(InMemoryRecordSet::sequential(5));
        let report = range_unit(&lifecycle, old, set, counting_op(&counter))
            .run()
            .unwrap();

        assert_eq!(report.stopped_by, Some(ItemOutcome::SkippedStale));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let record = lifecycle.record(&id(), &default()).unwrap().unwrap();
        assert_eq!(record.attempt_token, new);
        assert_eq!(record.status(), MigrationStatus::Running);
    }

    #[test]
    fn test_missing_record_skips() {
        let (_, lifecycle) = lifecycle();
        let counter = Arc::new(AtomicUsize::new(0));
        let set: Arc<dyn RecordSet> = Arc::new(InMemoryRecordSet::sequential(5));

        let report = range_unit(&lifecycle, Uuid::new_v4(), set, counting_op(&counter))
            .run()
            .unwrap();
        assert_eq!(report.stopped_by, Some(ItemOutcome::SkippedMissing));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transient_fetch_failure_is_retryable() {
        struct Unreachable;
        impl RecordSet for Unreachable {
            fn key_kind(&self) -> crate::migrations::range::KeyKind {
                crate::migrations::range::KeyKind::SequentialInt
            }
            fn key_bounds(
                &self,
            ) -> crate::migrations::errors::StoreResult<Option<(ItemKey, ItemKey)>> {
                Ok(None)
            }
            fn fetch(
                &self,
                _range: &KeyRange,
            ) -> crate::migrations::errors::StoreResult<Vec<MapperItem>> {
                Err(crate::migrations::errors::StoreError::transient("timeout"))
            }
        }

        let (store, lifecycle) = lifecycle();
        let token = lifecycle.start(&id(), &default()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let unit = range_unit(&lifecycle, token, Arc::new(Unreachable), counting_op(&counter));

        assert!(matches!(unit.run_task(), Err(TaskError::Retry(_))));
        let record = store.get(&default(), &id().key()).unwrap().unwrap();
        assert!(record.in_progress());
    }
}
