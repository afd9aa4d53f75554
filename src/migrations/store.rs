//! # Record Stores
//!
//! The record store is the only shared mutable resource: every coordination
//! between work units goes through it. A store must offer conditional create,
//! atomic read-modify-write, point lookup and bulk lookup, each scoped to one
//! partition.
//!
//! - [`InMemoryRecordStore`]: lock-protected map, with transient fault
//!   injection for tests
//! - [`FileRecordStore`]: JSON state file, written atomically on every change
//! - [`PartitionRouter`]: dispatches each call to the store that owns the
//!   partition

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::errors::{StoreError, StoreResult};
use super::key::Partition;
use super::state::MigrationRecord;

/// Mutation applied inside a store transaction.
///
/// Returns `true` when the record was changed and must be written back.
pub type RecordMutation<'a> = &'a mut dyn FnMut(&mut MigrationRecord) -> bool;

/// Transactional store of migration records
pub trait RecordStore: Send + Sync {
    /// Point lookup
    fn get(&self, partition: &Partition, key: &str) -> StoreResult<Option<MigrationRecord>>;

    /// Bulk lookup; missing keys are absent from the result
    fn get_many(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> StoreResult<HashMap<String, MigrationRecord>>;

    /// All records on a partition, ordered by key
    fn list(&self, partition: &Partition) -> StoreResult<Vec<MigrationRecord>>;

    /// Create the record only if no record exists for its key and partition
    fn create(&self, record: MigrationRecord) -> StoreResult<()>;

    /// Atomically load, mutate and (if changed) write back a record.
    ///
    /// Returns the record as it stands after the transaction, or `None` when
    /// no record exists.
    fn update(
        &self,
        partition: &Partition,
        key: &str,
        mutation: RecordMutation<'_>,
    ) -> StoreResult<Option<MigrationRecord>>;

    /// Delete a record; returns whether one existed
    fn delete(&self, partition: &Partition, key: &str) -> StoreResult<bool>;
}

/// Records grouped by partition, then key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct RecordTable {
    partitions: BTreeMap<Partition, BTreeMap<String, MigrationRecord>>,
}

impl RecordTable {
    fn get(&self, partition: &Partition, key: &str) -> Option<MigrationRecord> {
        self.partitions
            .get(partition)
            .and_then(|records| records.get(key))
            .cloned()
    }

    fn get_many(&self, partition: &Partition, keys: &[String]) -> HashMap<String, MigrationRecord> {
        let Some(records) = self.partitions.get(partition) else {
            return HashMap::new();
        };
        keys.iter()
            .filter_map(|key| records.get(key).map(|r| (key.clone(), r.clone())))
            .collect()
    }

    fn list(&self, partition: &Partition) -> Vec<MigrationRecord> {
        self.partitions
            .get(partition)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    fn create(&mut self, record: MigrationRecord) -> StoreResult<()> {
        let records = self.partitions.entry(record.partition.clone()).or_default();
        if records.contains_key(&record.key) {
            return Err(StoreError::AlreadyExists {
                key: record.key,
                partition: record.partition.to_string(),
            });
        }
        records.insert(record.key.clone(), record);
        Ok(())
    }

    /// Returns the resulting record and whether it changed
    fn update(
        &mut self,
        partition: &Partition,
        key: &str,
        mutation: RecordMutation<'_>,
    ) -> (Option<MigrationRecord>, bool) {
        let Some(record) = self
            .partitions
            .get_mut(partition)
            .and_then(|records| records.get_mut(key))
        else {
            return (None, false);
        };

        let mut working = record.clone();
        let changed = mutation(&mut working);
        if changed {
            *record = working.clone();
        }
        (Some(working), changed)
    }

    fn delete(&mut self, partition: &Partition, key: &str) -> bool {
        self.partitions
            .get_mut(partition)
            .map(|records| records.remove(key).is_some())
            .unwrap_or(false)
    }
}

/// In-memory record store
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    table: RwLock<RecordTable>,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` reads fail with a transient error
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail with a transient error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn injected_failure(counter: &AtomicUsize, what: &str) -> StoreResult<()> {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StoreError::transient(format!("injected {} failure", what)));
        }
        Ok(())
    }

    fn check_read(&self) -> StoreResult<()> {
        Self::injected_failure(&self.failing_reads, "read")
    }

    fn check_write(&self) -> StoreResult<()> {
        Self::injected_failure(&self.failing_writes, "write")
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get(&self, partition: &Partition, key: &str) -> StoreResult<Option<MigrationRecord>> {
        self.check_read()?;
        let table = self.table.read().map_err(|_| StoreError::poisoned())?;
        Ok(table.get(partition, key))
    }

    fn get_many(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> StoreResult<HashMap<String, MigrationRecord>> {
        self.check_read()?;
        let table = self.table.read().map_err(|_| StoreError::poisoned())?;
        Ok(table.get_many(partition, keys))
    }

    fn list(&self, partition: &Partition) -> StoreResult<Vec<MigrationRecord>> {
        self.check_read()?;
        let table = self.table.read().map_err(|_| StoreError::poisoned())?;
        Ok(table.list(partition))
    }

    fn create(&self, record: MigrationRecord) -> StoreResult<()> {
        self.check_write()?;
        let mut table = self.table.write().map_err(|_| StoreError::poisoned())?;
        table.create(record)
    }

    fn update(
        &self,
        partition: &Partition,
        key: &str,
        mutation: RecordMutation<'_>,
    ) -> StoreResult<Option<MigrationRecord>> {
        self.check_write()?;
        let mut table = self.table.write().map_err(|_| StoreError::poisoned())?;
        Ok(table.update(partition, key, mutation).0)
    }

    fn delete(&self, partition: &Partition, key: &str) -> StoreResult<bool> {
        self.check_write()?;
        let mut table = self.table.write().map_err(|_| StoreError::poisoned())?;
        Ok(table.delete(partition, key))
    }
}

/// Record store persisted to a JSON state file.
///
/// Every mutation is applied to a copy of the table, written to a temp file
/// and renamed over the state file; the in-memory table only changes once the
/// rename succeeded. Intended for a single process at a time.
#[derive(Debug)]
pub struct FileRecordStore {
    state_file: PathBuf,
    table: Mutex<RecordTable>,
}

impl FileRecordStore {
    /// Open (or create on first write) the state file at `state_file`
    pub fn open(state_file: impl Into<PathBuf>) -> StoreResult<Self> {
        let state_file = state_file.into();
        let table = Self::load(&state_file)?;
        Ok(Self {
            state_file,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    fn load(path: &Path) -> StoreResult<RecordTable> {
        if !path.exists() {
            return Ok(RecordTable::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| StoreError::Io {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;

        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    fn save(&self, table: &RecordTable) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(table).map_err(|e| StoreError::Internal {
            message: format!("Failed to serialize state: {}", e),
        })?;

        if let Some(parent) = self.state_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                    message: format!("Failed to create {}: {}", parent.display(), e),
                })?;
            }
        }

        // Atomic write: write to temp file, then rename
        let temp_file = self.state_file.with_extension("json.tmp");
        std::fs::write(&temp_file, &content).map_err(|e| StoreError::Io {
            message: format!("Failed to write {}: {}", temp_file.display(), e),
        })?;

        std::fs::rename(&temp_file, &self.state_file).map_err(|e| StoreError::Io {
            message: format!("Failed to replace {}: {}", self.state_file.display(), e),
        })
    }

    fn with_table<T>(&self, f: impl FnOnce(&RecordTable) -> T) -> StoreResult<T> {
        let table = self.table.lock().map_err(|_| StoreError::poisoned())?;
        Ok(f(&table))
    }

    /// Apply `f` to a copy of the table and persist it when `f` reports a change
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut RecordTable) -> StoreResult<(T, bool)>,
    ) -> StoreResult<T> {
        let mut table = self.table.lock().map_err(|_| StoreError::poisoned())?;
        let mut working = table.clone();
        let (result, changed) = f(&mut working)?;
        if changed {
            self.save(&working)?;
            *table = working;
        }
        Ok(result)
    }
}

impl RecordStore for FileRecordStore {
    fn get(&self, partition: &Partition, key: &str) -> StoreResult<Option<MigrationRecord>> {
        self.with_table(|t| t.get(partition, key))
    }

    fn get_many(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> StoreResult<HashMap<String, MigrationRecord>> {
        self.with_table(|t| t.get_many(partition, keys))
    }

    fn list(&self, partition: &Partition) -> StoreResult<Vec<MigrationRecord>> {
        self.with_table(|t| t.list(partition))
    }

    fn create(&self, record: MigrationRecord) -> StoreResult<()> {
        self.transact(|t| t.create(record).map(|()| ((), true)))
    }

    fn update(
        &self,
        partition: &Partition,
        key: &str,
        mutation: RecordMutation<'_>,
    ) -> StoreResult<Option<MigrationRecord>> {
        self.transact(|t| Ok(t.update(partition, key, mutation)))
    }

    fn delete(&self, partition: &Partition, key: &str) -> StoreResult<bool> {
        self.transact(|t| {
            let existed = t.delete(partition, key);
            Ok((existed, existed))
        })
    }
}

/// Routes each call to the store responsible for the partition
#[derive(Clone, Default)]
pub struct PartitionRouter {
    routes: HashMap<Partition, Arc<dyn RecordStore>>,
    fallback: Option<Arc<dyn RecordStore>>,
}

impl PartitionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store used for a specific partition
    pub fn route(mut self, partition: impl Into<Partition>, store: Arc<dyn RecordStore>) -> Self {
        self.routes.insert(partition.into(), store);
        self
    }

    /// Store used for partitions without a dedicated route
    pub fn fallback(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.fallback = Some(store);
        self
    }

    fn store_for(&self, partition: &Partition) -> StoreResult<&Arc<dyn RecordStore>> {
        self.routes
            .get(partition)
            .or(self.fallback.as_ref())
            .ok_or_else(|| StoreError::UnknownPartition {
                partition: partition.to_string(),
            })
    }
}

impl RecordStore for PartitionRouter {
    fn get(&self, partition: &Partition, key: &str) -> StoreResult<Option<MigrationRecord>> {
        self.store_for(partition)?.get(partition, key)
    }

    fn get_many(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> StoreResult<HashMap<String, MigrationRecord>> {
        self.store_for(partition)?.get_many(partition, keys)
    }

    fn list(&self, partition: &Partition) -> StoreResult<Vec<MigrationRecord>> {
        self.store_for(partition)?.list(partition)
    }

    fn create(&self, record: MigrationRecord) -> StoreResult<()> {
        let store = self.store_for(&record.partition)?.clone();
        store.create(record)
    }

    fn update(
        &self,
        partition: &Partition,
        key: &str,
        mutation: RecordMutation<'_>,
    ) -> StoreResult<Option<MigrationRecord>> {
        self.store_for(partition)?.update(partition, key, mutation)
    }

    fn delete(&self, partition: &Partition, key: &str) -> StoreResult<bool> {
        self.store_for(partition)?.delete(partition, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn default() -> Partition {
        Partition::new("default")
    }

    fn record(key: &str) -> MigrationRecord {
        MigrationRecord::new_attempt(key, default())
    }

    #[test]
    fn test_conditional_create() {
        let store = InMemoryRecordStore::new();
        store.create(record("app:0001_a")).unwrap();

        let err = store.create(record("app:0001_a")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        // Same key on another partition is independent
        store
            .create(MigrationRecord::new_attempt("app:0001_a", Partition::new("other")))
            .unwrap();
    }

    #[test]
    fn test_update_only_writes_when_changed() {
        let store = InMemoryRecordStore::new();
        store.create(record("app:0001_a")).unwrap();

        let unchanged = store
            .update(&default(), "app:0001_a", &mut |r| {
                r.has_error = true;
                false
            })
            .unwrap()
            .unwrap();
        assert!(unchanged.has_error); // Caller sees its working copy
        assert!(!store.get(&default(), "app:0001_a").unwrap().unwrap().has_error);

        store
            .update(&default(), "app:0001_a", &mut |r| {
                r.has_error = true;
                true
            })
            .unwrap();
        assert!(store.get(&default(), "app:0001_a").unwrap().unwrap().has_error);
    }

    #[test]
    fn test_update_missing_record() {
        let store = InMemoryRecordStore::new();
        let result = store.update(&default(), "app:0001_a", &mut |_| true).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_get_many() {
        let store = InMemoryRecordStore::new();
        store.create(record("app:0001_a")).unwrap();
        store.create(record("app:0002_b")).unwrap();

        let found = store
            .get_many(
                &default(),
                &["app:0001_a".to_string(), "app:0003_c".to_string()],
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("app:0001_a"));
    }

    #[test]
    fn test_injected_failures_are_transient_and_bounded() {
        let store = InMemoryRecordStore::new();
        store.fail_next_writes(2);

        assert!(store.create(record("app:0001_a")).unwrap_err().is_transient());
        assert!(store.create(record("app:0001_a")).unwrap_err().is_transient());
        store.create(record("app:0001_a")).unwrap();

        store.fail_next_reads(1);
        assert!(store.get(&default(), "app:0001_a").is_err());
        assert!(store.get(&default(), "app:0001_a").unwrap().is_some());
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("records.json");

        let original = record("app:0001_a");
        {
            let store = FileRecordStore::open(&path).unwrap();
            store.create(original.clone()).unwrap();
            store
                .update(&default(), "app:0001_a", &mut |r| {
                    r.mark_errored("bad data");
                    true
                })
                .unwrap();
        }

        let reopened = FileRecordStore::open(&path).unwrap();
        let loaded = reopened.get(&default(), "app:0001_a").unwrap().unwrap();
        assert_eq!(loaded.attempt_token, original.attempt_token);
        assert!(loaded.has_error);
        assert_eq!(loaded.last_error, "bad data");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_file_store_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileRecordStore::open(temp_dir.path().join("records.json")).unwrap();

        store.create(record("app:0001_a")).unwrap();
        assert!(store.delete(&default(), "app:0001_a").unwrap());
        assert!(!store.delete(&default(), "app:0001_a").unwrap());
        assert!(store.list(&default()).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_rejects_corrupt_state() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("records.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileRecordStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_router_dispatches_by_partition() {
        let primary = Arc::new(InMemoryRecordStore::new());
        let analytics = Arc::new(InMemoryRecordStore::new());
        let router = PartitionRouter::new()
            .route("default", primary.clone())
            .route("analytics", analytics.clone());

        router
            .create(MigrationRecord::new_attempt("app:0001_a", Partition::new("analytics")))
            .unwrap();

        assert!(analytics
            .get(&Partition::new("analytics"), "app:0001_a")
            .unwrap()
            .is_some());
        assert!(primary.list(&Partition::new("analytics")).unwrap().is_empty());

        let err = router.get(&Partition::new("unknown"), "app:0001_a").unwrap_err();
        assert!(matches!(err, StoreError::UnknownPartition { .. }));
    }
}
