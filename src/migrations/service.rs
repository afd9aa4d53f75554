//! # Migration Service
//!
//! Operator-facing entry point. Ties the registry, the lifecycle engine and
//! the backends together: launching migrations, resetting and faking
//! records, and reporting status per partition.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::backend::{BackendRegistry, DEFAULT_SHARD_COUNT};
use super::cache::{RecordCache, StateCache};
use super::definition::{Migration, MigrationKind};
use super::enforcement::Enforcer;
use super::errors::{MigrationError, MigrationResult};
use super::key::{MigrationId, Partition};
use super::lifecycle::Lifecycle;
use super::registry::MigrationRegistry;
use super::state::{MigrationRecord, MigrationStatus};
use super::store::RecordStore;
use crate::config::MassMigrationConfig;

/// What a launch scheduled
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReceipt {
    pub key: String,
    pub partition: Partition,
    pub backend: String,
    pub queue: String,
    pub attempt_token: Uuid,
}

/// State of one migration on one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStatus {
    pub partition: Partition,
    pub allowed: bool,
    /// `None` where the migration is not allowed to run
    pub status: Option<MigrationStatus>,
}

/// One row of the overview table
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOverview {
    pub key: String,
    pub description: String,
    pub kind: &'static str,
    pub partitions: Vec<PartitionStatus>,
}

/// A dependency and its record on the inspected partition
#[derive(Debug, Clone, Serialize)]
pub struct DependencyDetail {
    pub key: String,
    pub status: MigrationStatus,
    pub record: Option<MigrationRecord>,
}

/// Everything known about a migration on one partition
#[derive(Debug, Clone, Serialize)]
pub struct MigrationDetail {
    pub key: String,
    pub description: String,
    pub kind: &'static str,
    pub partition: Partition,
    pub status: MigrationStatus,
    pub record: Option<MigrationRecord>,
    pub dependencies: Vec<DependencyDetail>,
}

/// Operator actions and queries over registered migrations
pub struct MigrationService {
    registry: Arc<MigrationRegistry>,
    lifecycle: Arc<Lifecycle>,
    backends: BackendRegistry,
    default_queue: Option<String>,
    shard_count: usize,
    enforcer: Enforcer,
}

impl MigrationService {
    /// Create a service without a default queue
    pub fn new(
        registry: Arc<MigrationRegistry>,
        lifecycle: Arc<Lifecycle>,
        backends: BackendRegistry,
    ) -> Self {
        let enforcer = Enforcer::new(registry.clone(), lifecycle.clone());
        Self {
            registry,
            lifecycle,
            backends,
            default_queue: None,
            shard_count: DEFAULT_SHARD_COUNT,
            enforcer,
        }
    }

    /// Queue used by migrations that do not name their own
    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = Some(queue.into());
        self
    }

    /// Number of key ranges mapper migrations are split into
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    /// Wire a service from configuration.
    ///
    /// Registers `migrations` against the configured partitions and applies
    /// the configured default backend, queue and shard count.
    pub fn from_config(
        config: &MassMigrationConfig,
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn StateCache>,
        mut backends: BackendRegistry,
        migrations: Vec<Migration>,
    ) -> MigrationResult<Self> {
        let mut registry = MigrationRegistry::new(config.partitions());
        for migration in migrations {
            registry.register(migration)?;
        }

        if let Some(name) = &config.default_backend {
            backends.set_default(name)?;
        }

        let record_cache = RecordCache::new(cache, store.clone(), config.cache_ttl());
        let lifecycle = Arc::new(Lifecycle::new(store, record_cache, config.retry.clone()));

        let mut service = Self::new(Arc::new(registry), lifecycle, backends)
            .with_shard_count(config.shard_count);
        service.default_queue = config.task_queue.clone();
        Ok(service)
    }

    pub fn registry(&self) -> &Arc<MigrationRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    fn resolve_partition(&self, partition: Option<&Partition>) -> MigrationResult<Partition> {
        match partition {
            Some(partition) => Ok(partition.clone()),
            None => self
                .registry
                .default_partition()
                .cloned()
                .ok_or_else(|| MigrationError::configuration("No partitions configured")),
        }
    }

    fn resolve_queue(&self, migration: &Migration) -> MigrationResult<String> {
        migration
            .config()
            .queue
            .clone()
            .or_else(|| self.default_queue.clone())
            .filter(|queue| !queue.trim().is_empty())
            .ok_or_else(|| {
                MigrationError::configuration(format!(
                    "No task queue configured for migration '{}'",
                    migration.id()
                ))
            })
    }

    fn checked_partition(&self, partition: Option<&Partition>) -> MigrationResult<Partition> {
        let partition = self.resolve_partition(partition)?;
        if !self.registry.is_configured(&partition) {
            return Err(MigrationError::InvalidPartition {
                partition: partition.to_string(),
                reason: "not a configured partition".to_string(),
            });
        }
        Ok(partition)
    }

    /// Fail unless the migration may run on `partition`
    pub fn check_can_run_on_partition(&self, key: &str, partition: &Partition) -> MigrationResult<()> {
        let migration = self.registry.get_or_err(key)?;
        self.registry.check_can_run_on_partition(&migration, partition)
    }

    /// Launch a migration on a partition (the default partition when `None`).
    ///
    /// Configuration problems, unmet dependencies and an existing record are
    /// all reported before anything is scheduled.
    pub fn launch(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<LaunchReceipt> {
        let migration = self.registry.get_or_err(key)?;
        let partition = self.resolve_partition(partition)?;
        self.registry.check_can_run_on_partition(&migration, &partition)?;

        let backend = self.backends.resolve(migration.config().backend.as_deref())?;
        let queue = self.resolve_queue(&migration)?;

        self.lifecycle.check_dependencies(migration.config(), &partition)?;
        if !self.lifecycle.can_start(migration.id(), &partition)? {
            return Err(MigrationError::AlreadyStarted {
                key: migration.key(),
                partition: partition.to_string(),
            });
        }

        info!(
            migration = %migration.id(),
            partition = %partition,
            backend = backend.name(),
            queue = %queue,
            kind = migration.kind().name(),
            "launching migration"
        );

        let attempt_token = match migration.kind() {
            MigrationKind::Simple { .. } => {
                backend.run_simple(&self.lifecycle, &migration, &partition, &queue)?
            }
            MigrationKind::Mapper { .. } => backend.run_mapper(
                &self.lifecycle,
                &migration,
                &partition,
                &queue,
                self.shard_count,
            )?,
        };

        Ok(LaunchReceipt {
            key: migration.key(),
            partition,
            backend: backend.name().to_string(),
            queue,
            attempt_token,
        })
    }

    /// Delete a record so the migration can be launched again.
    ///
    /// Works for keys no longer registered. A running attempt is only
    /// deleted with `force`.
    pub fn delete_record(
        &self,
        key: &str,
        partition: Option<&Partition>,
        force: bool,
    ) -> MigrationResult<MigrationRecord> {
        let id = MigrationId::parse(key)?;
        let partition = self.checked_partition(partition)?;
        let deleted = self.lifecycle.delete(&id, &partition, force)?;
        self.enforcer.forget(&id.key(), &partition);
        Ok(deleted)
    }

    /// Record a migration as applied without running it
    pub fn fake_applied(
        &self,
        key: &str,
        partition: Option<&Partition>,
    ) -> MigrationResult<MigrationRecord> {
        let migration = self.registry.get_or_err(key)?;
        let partition = self.resolve_partition(partition)?;
        self.registry.check_can_run_on_partition(&migration, &partition)?;
        self.lifecycle.fake_applied(migration.id(), &partition)
    }

    fn record(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<Option<MigrationRecord>> {
        let id = MigrationId::parse(key)?;
        let partition = self.checked_partition(partition)?;
        self.lifecycle.record(&id, &partition)
    }

    pub fn status(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<MigrationStatus> {
        Ok(MigrationStatus::of(self.record(key, partition)?.as_ref()))
    }

    pub fn is_applied(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<bool> {
        Ok(self.record(key, partition)?.map_or(false, |r| r.is_applied))
    }

    pub fn was_started(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<bool> {
        Ok(self.record(key, partition)?.is_some())
    }

    pub fn is_in_progress(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<bool> {
        Ok(self.record(key, partition)?.map_or(false, |r| r.in_progress()))
    }

    pub fn can_start(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<bool> {
        Ok(self.record(key, partition)?.is_none())
    }

    /// Status of every registered migration on every configured partition,
    /// using one bulk lookup per partition
    pub fn overview(&self) -> MigrationResult<Vec<MigrationOverview>> {
        let migrations = self.registry.all();
        let keys: Vec<String> = migrations.iter().map(|m| m.key()).collect();

        let mut records: HashMap<Partition, HashMap<String, MigrationRecord>> = HashMap::new();
        for partition in self.registry.partitions() {
            let found = self.lifecycle.store().get_many(partition, &keys)?;
            records.insert(partition.clone(), found);
        }

        Ok(migrations
            .iter()
            .map(|migration| {
                let key = migration.key();
                let partitions = self
                    .registry
                    .partitions()
                    .iter()
                    .map(|partition| {
                        let allowed = migration.config().allows(partition);
                        let status = allowed.then(|| {
                            MigrationStatus::of(
                                records.get(partition).and_then(|found| found.get(&key)),
                            )
                        });
                        PartitionStatus {
                            partition: partition.clone(),
                            allowed,
                            status,
                        }
                    })
                    .collect();

                MigrationOverview {
                    key,
                    description: migration.config().description.clone(),
                    kind: migration.kind().name(),
                    partitions,
                }
            })
            .collect())
    }

    /// The record of a migration on a partition, with its dependencies'
    pub fn detail(&self, key: &str, partition: Option<&Partition>) -> MigrationResult<MigrationDetail> {
        let migration = self.registry.get_or_err(key)?;
        let partition = self.checked_partition(partition)?;
        let record = self.lifecycle.record(migration.id(), &partition)?;

        let dependency_keys: Vec<String> = migration
            .config()
            .dependencies
            .iter()
            .map(MigrationId::key)
            .collect();
        let mut found = self.lifecycle.store().get_many(&partition, &dependency_keys)?;
        let dependencies = dependency_keys
            .into_iter()
            .map(|key| {
                let record = found.remove(&key);
                DependencyDetail {
                    key,
                    status: MigrationStatus::of(record.as_ref()),
                    record,
                }
            })
            .collect();

        Ok(MigrationDetail {
            key: migration.key(),
            description: migration.config().description.clone(),
            kind: migration.kind().name(),
            status: MigrationStatus::of(record.as_ref()),
            partition,
            record,
            dependencies,
        })
    }

    /// See [`Enforcer::require_applied`]
    pub fn require_applied(&self, key: &str, partitions: Option<&[Partition]>) -> MigrationResult<()> {
        self.enforcer.require_applied(key, partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::backend::TaskBackend;
    use crate::migrations::cache::TtlCache;
    use crate::migrations::dispatch::QueueDispatcher;
    use crate::migrations::range::{InMemoryRecordSet, RecordSet};
    use crate::migrations::retry::RetryPolicy;
    use crate::migrations::store::InMemoryRecordStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        dispatcher: Arc<QueueDispatcher>,
        service: MigrationService,
    }

    fn harness(migrations: Vec<Migration>) -> Harness {
        harness_with_shards(migrations, DEFAULT_SHARD_COUNT)
    }

    fn harness_with_shards(migrations: Vec<Migration>, shard_count: usize) -> Harness {
        let config = MassMigrationConfig {
            partitions: vec!["default".to_string(), "analytics".to_string()],
            task_queue: Some("migrations".to_string()),
            retry: RetryPolicy::immediate(3),
            shard_count,
            ..Default::default()
        };
        let dispatcher = Arc::new(QueueDispatcher::new(RetryPolicy::immediate(3)));
        let mut backends = BackendRegistry::new();
        backends
            .register(Arc::new(TaskBackend::new("tasks", dispatcher.clone())))
            .unwrap();

        let service = MigrationService::from_config(
            &config,
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(TtlCache::new()),
            backends,
            migrations,
        )
        .unwrap();
        Harness {
            dispatcher,
            service,
        }
    }

    fn simple(name: &str) -> Migration {
        Migration::simple("app1", name, |_| Ok(())).unwrap()
    }

    #[test]
    fn test_launch_simple_on_default_partition() {
        let h = harness(vec![simple("0001_backfill")]);

        let receipt = h.service.launch("app1:0001_backfill", None).unwrap();
        assert_eq!(receipt.partition, Partition::new("default"));
        assert_eq!(receipt.backend, "tasks");
        assert_eq!(receipt.queue, "migrations");
        let record = h
            .service
            .lifecycle()
            .store()
            .get(&receipt.partition, &receipt.key)
            .unwrap()
            .unwrap();
        assert_eq!(record.attempt_token, receipt.attempt_token);

        h.dispatcher.run_pending();
        assert!(h.service.is_applied("app1:0001_backfill", None).unwrap());
        assert!(!h
            .service
            .was_started("app1:0001_backfill", Some(&Partition::new("analytics")))
            .unwrap());
    }

    #[test]
    fn test_launch_rejects_started_migration() {
        let h = harness(vec![simple("0001_backfill")]);
        h.service.launch("app1:0001_backfill", None).unwrap();
        h.dispatcher.run_pending();

        let err = h.service.launch("app1:0001_backfill", None).unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_STARTED");
    }

    #[test]
    fn test_second_launch_before_drain_is_rejected() {
        let h = harness(vec![simple("0001_backfill")]);
        h.service.launch("app1:0001_backfill", None).unwrap();

        let err = h.service.launch("app1:0001_backfill", None).unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_STARTED");
        assert_eq!(h.dispatcher.len(), 1);

        h.dispatcher.run_pending();
        assert!(h.service.is_applied("app1:0001_backfill", None).unwrap());
    }

    #[test]
    fn test_mapper_launch_uses_configured_shard_count() {
        let set: Arc<dyn RecordSet> = Arc::new(InMemoryRecordSet::sequential(1_000));
        let visited = Arc::new(AtomicUsize::new(0));
        let op_visited = visited.clone();
        let migration = Migration::mapper(
            "app1",
            "0002_touch",
            move |_| set.clone(),
            move |_, _| {
                op_visited.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();
        let h = harness_with_shards(vec![migration], 2);

        h.service.launch("app1:0002_touch", None).unwrap();
        assert_eq!(h.dispatcher.len(), 2);

        h.dispatcher.run_pending();
        assert_eq!(visited.load(Ordering::SeqCst), 1_000);
        assert!(h.service.is_applied("app1:0002_touch", None).unwrap());
    }

    #[test]
    fn test_delete_record_clears_remembered_requirement() {
        let h = harness(vec![simple("0001_backfill")]);
        let default = [Partition::new("default")];

        h.service.fake_applied("app1:0001_backfill", None).unwrap();
        h.service
            .require_applied("app1:0001_backfill", Some(&default))
            .unwrap();

        h.service
            .delete_record("app1:0001_backfill", None, false)
            .unwrap();
        let err = h
            .service
            .require_applied("app1:0001_backfill", Some(&default))
            .unwrap_err();
        assert_eq!(err.error_code(), "REQUIRED_MIGRATION_NOT_APPLIED");
    }

    #[test]
    fn test_launch_checks_dependencies_first() {
        let h = harness(vec![
            simple("0001_first"),
            simple("0002_second").depends_on("app1", "0001_first").unwrap(),
        ]);

        let err = h.service.launch("app1:0002_second", None).unwrap_err();
        assert_eq!(err.error_code(), "DEPENDENCY_NOT_APPLIED");
        assert!(h.dispatcher.is_empty());
        assert!(h.service.can_start("app1:0002_second", None).unwrap());

        h.service.launch("app1:0001_first", None).unwrap();
        h.dispatcher.run_pending();
        h.service.launch("app1:0002_second", None).unwrap();
        h.dispatcher.run_pending();
        assert_eq!(
            h.service.status("app1:0002_second", None).unwrap(),
            MigrationStatus::Applied
        );
    }

    #[test]
    fn test_launch_configuration_errors() {
        let h = harness(vec![
            simple("0001_backfill").backend("missing"),
            simple("0002_other").allowed_partitions(["analytics"]),
        ]);

        let err = h.service.launch("app1:0001_backfill", None).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");

        let err = h.service.launch("app1:0002_other", None).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PARTITION");

        let err = h.service.launch("app1:0003_unknown", None).unwrap_err();
        assert_eq!(err.error_code(), "MIGRATION_NOT_FOUND");
    }

    #[test]
    fn test_launch_without_queue_is_configuration_error() {
        let mut registry = MigrationRegistry::new(vec![Partition::new("default")]);
        registry.register(simple("0001_backfill")).unwrap();
        let store = Arc::new(InMemoryRecordStore::new());
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            RecordCache::new(Arc::new(TtlCache::new()), store, Duration::from_secs(10)),
            RetryPolicy::immediate(1),
        ));
        let mut backends = BackendRegistry::new();
        backends
            .register(Arc::new(TaskBackend::new(
                "tasks",
                Arc::new(QueueDispatcher::default()),
            )))
            .unwrap();

        let service = MigrationService::new(Arc::new(registry), lifecycle, backends);
        let err = service.launch("app1:0001_backfill", None).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");

        let service = service.with_default_queue("migrations");
        service.launch("app1:0001_backfill", None).unwrap();
    }

    #[test]
    fn test_delete_and_fake() {
        let failing = Migration::simple("app1", "0001_backfill", |_| anyhow::bail!("bad data")).unwrap();
        let h = harness(vec![failing]);

        h.service.launch("app1:0001_backfill", None).unwrap();
        h.dispatcher.run_pending();
        assert_eq!(
            h.service.status("app1:0001_backfill", None).unwrap(),
            MigrationStatus::Errored
        );

        let deleted = h.service.delete_record("app1:0001_backfill", None, false).unwrap();
        assert!(deleted.has_error);
        assert!(h.service.can_start("app1:0001_backfill", None).unwrap());

        h.service.fake_applied("app1:0001_backfill", None).unwrap();
        assert!(h.service.is_applied("app1:0001_backfill", None).unwrap());
        h.service
            .require_applied("app1:0001_backfill", Some(&[Partition::new("default")]))
            .unwrap();
    }

    #[test]
    fn test_overview_and_detail() {
        let h = harness(vec![
            simple("0001_first"),
            simple("0002_second")
                .description("Second step")
                .depends_on("app1", "0001_first")
                .unwrap()
                .allowed_partitions(["default"]),
        ]);
        h.service.launch("app1:0001_first", None).unwrap();
        h.dispatcher.run_pending();

        let overview = h.service.overview().unwrap();
        assert_eq!(overview.len(), 2);
        assert_eq!(
            overview[0].partitions[0].status,
            Some(MigrationStatus::Applied)
        );
        assert_eq!(
            overview[0].partitions[1].status,
            Some(MigrationStatus::NotStarted)
        );
        assert!(!overview[1].partitions[1].allowed);
        assert_eq!(overview[1].partitions[1].status, None);

        let detail = h.service.detail("app1:0002_second", None).unwrap();
        assert_eq!(detail.description, "Second step");
        assert_eq!(detail.status, MigrationStatus::NotStarted);
        assert_eq!(detail.dependencies.len(), 1);
        assert_eq!(detail.dependencies[0].status, MigrationStatus::Applied);
        assert!(detail.dependencies[0].record.is_some());
    }

    #[test]
    fn test_in_progress_delete_needs_force() {
        let h = harness(vec![simple("0001_backfill")]);
        let id = MigrationId::parse("app1:0001_backfill").unwrap();
        h.service
            .lifecycle()
            .start(&id, &Partition::new("default"))
            .unwrap();

        assert!(h.service.is_in_progress("app1:0001_backfill", None).unwrap());
        let err = h
            .service
            .delete_record("app1:0001_backfill", None, false)
            .unwrap_err();
        assert_eq!(err.error_code(), "ATTEMPT_IN_PROGRESS");
        h.service
            .delete_record("app1:0001_backfill", None, true)
            .unwrap();
    }
}
