//! # Hot-Path Record Cache
//!
//! Every item a mapper visits asks "is my attempt still current?". Answering
//! from the record store each time would cost one read per item, so records
//! are served from a short-TTL cache instead.
//!
//! Lifecycle mutations write the new record through to the cache, but that
//! refresh is best effort: the TTL is the only bound on how long a reader can
//! observe a record from before an error or a reset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::errors::StoreResult;
use super::key::Partition;
use super::state::MigrationRecord;
use super::store::RecordStore;

/// Default TTL for cached records
pub const DEFAULT_RECORD_CACHE_TTL: Duration = Duration::from_secs(60);

/// Time source for TTL expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// Key/value cache with per-entry TTL
pub trait StateCache: Send + Sync {
    fn get(&self, key: &str) -> Option<MigrationRecord>;
    fn set(&self, key: &str, record: MigrationRecord, ttl: Duration);
    fn invalidate(&self, key: &str);
}

/// Process-local TTL cache
pub struct TtlCache {
    entries: Mutex<HashMap<String, (MigrationRecord, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCache for TtlCache {
    fn get(&self, key: &str) -> Option<MigrationRecord> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((record, expires_at)) if *expires_at > now => Some(record.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, record: MigrationRecord, ttl: Duration) {
        // An expiry past the end of the calendar is not cached
        let Some(expires_at) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
        else {
            return;
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), (record, expires_at));
        }
    }

    fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// Cache key for a migration on a partition
pub fn cache_key(migration_key: &str, partition: &Partition) -> String {
    format!("massmigration_record:{}:{}", migration_key, partition)
}

/// Read-through, write-through cache of migration records
#[derive(Clone)]
pub struct RecordCache {
    cache: Arc<dyn StateCache>,
    store: Arc<dyn RecordStore>,
    ttl: Duration,
}

impl RecordCache {
    pub fn new(cache: Arc<dyn StateCache>, store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self { cache, store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached record, falling back to the store on a miss.
    ///
    /// Absence is not cached: a missing record is re-read every time.
    pub fn get_record(
        &self,
        migration_key: &str,
        partition: &Partition,
    ) -> StoreResult<Option<MigrationRecord>> {
        let key = cache_key(migration_key, partition);
        if let Some(record) = self.cache.get(&key) {
            return Ok(Some(record));
        }

        let record = self.store.get(partition, migration_key)?;
        if let Some(record) = &record {
            self.cache.set(&key, record.clone(), self.ttl);
        }
        Ok(record)
    }

    /// Write a freshly mutated record through to the cache
    pub fn refresh(&self, record: &MigrationRecord) {
        self.cache.set(
            &cache_key(&record.key, &record.partition),
            record.clone(),
            self.ttl,
        );
    }

    pub fn invalidate(&self, migration_key: &str, partition: &Partition) {
        self.cache.invalidate(&cache_key(migration_key, partition));
    }
}
