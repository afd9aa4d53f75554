//! # Execution Backends
//!
//! A backend turns a launch request into scheduled work. Backends are
//! registered once at startup under an identifier and resolved per launch:
//! the migration's own override wins, otherwise the registry default.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use super::definition::{Migration, MigrationKind};
use super::dispatch::{enqueue_fan_out, Task, TaskDispatcher};
use super::errors::{MigrationError, MigrationResult};
use super::key::{MigrationId, Partition};
use super::lifecycle::Lifecycle;
use super::range::default_splitter;
use super::runner::{finalize, RangeUnit, SimpleUnit};

/// Default number of ranges a mapper's key space is cut into
pub const DEFAULT_SHARD_COUNT: usize = 32;

/// Capability every execution backend provides
pub trait Backend: Send + Sync {
    /// Identifier the backend is registered under
    fn name(&self) -> &str;

    /// Start the attempt, then schedule the single unit of a simple
    /// migration. Returns the attempt token.
    fn run_simple(
        &self,
        lifecycle: &Arc<Lifecycle>,
        migration: &Migration,
        partition: &Partition,
        queue: &str,
    ) -> MigrationResult<Uuid>;

    /// Start the attempt, then fan out one unit per key range (at most
    /// `shard_count` ranges) followed by a finalize step. Returns the attempt
    /// token.
    fn run_mapper(
        &self,
        lifecycle: &Arc<Lifecycle>,
        migration: &Migration,
        partition: &Partition,
        queue: &str,
        shard_count: usize,
    ) -> MigrationResult<Uuid>;
}

/// Backend that schedules work on a [`TaskDispatcher`]
pub struct TaskBackend {
    name: String,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl TaskBackend {
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            name: name.into(),
            dispatcher,
        }
    }

    /// Record a scheduling failure on an attempt that was already started
    fn abandon_attempt(
        &self,
        lifecycle: &Lifecycle,
        id: &MigrationId,
        partition: &Partition,
        token: Uuid,
        reason: String,
    ) -> MigrationResult<()> {
        error!(migration = %id, partition = %partition, error = %reason, "failed to schedule migration units");
        lifecycle.mark_errored(id, partition, token, &reason)?;
        Ok(())
    }
}

impl Backend for TaskBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_simple(
        &self,
        lifecycle: &Arc<Lifecycle>,
        migration: &Migration,
        partition: &Partition,
        queue: &str,
    ) -> MigrationResult<Uuid> {
        let MigrationKind::Simple { operation } = migration.kind() else {
            return Err(MigrationError::configuration(format!(
                "Migration '{}' is not a simple migration",
                migration.key()
            )));
        };

        let id = migration.id().clone();
        let token = lifecycle.start(&id, partition)?;

        let unit = Arc::new(SimpleUnit::new(
            lifecycle.clone(),
            id.clone(),
            operation.clone(),
            partition.clone(),
            token,
        ));
        let task: Task = Arc::new(move || unit.run());
        if let Err(err) = self.dispatcher.enqueue(queue, task) {
            self.abandon_attempt(
                lifecycle,
                &id,
                partition,
                token,
                format!("failed to schedule migration unit: {}", err),
            )?;
            return Err(err.into());
        }

        info!(migration = %id, partition = %partition, attempt = %token, backend = %self.name, queue, "simple migration scheduled");
        Ok(token)
    }

    fn run_mapper(
        &self,
        lifecycle: &Arc<Lifecycle>,
        migration: &Migration,
        partition: &Partition,
        queue: &str,
        shard_count: usize,
    ) -> MigrationResult<Uuid> {
        let MigrationKind::Mapper {
            record_set,
            operation,
            key_splitter,
        } = migration.kind()
        else {
            return Err(MigrationError::configuration(format!(
                "Migration '{}' is not a mapper migration",
                migration.key()
            )));
        };

        // Everything that can fail without side effects happens before start
        let record_set = record_set(partition);
        let splitter = key_splitter
            .clone()
            .unwrap_or_else(|| default_splitter(record_set.key_kind()));
        let bounds = record_set.key_bounds()?;
        let ranges = splitter.split(bounds.as_ref(), shard_count.max(1));

        let id = migration.id().clone();
        let token = lifecycle.start(&id, partition)?;

        let units: Vec<Task> = ranges
            .iter()
            .map(|range| {
                let unit = RangeUnit::new(
                    lifecycle.clone(),
                    id.clone(),
                    partition.clone(),
                    token,
                    record_set.clone(),
                    operation.clone(),
                    range.clone(),
                );
                Arc::new(move || unit.run_task()) as Task
            })
            .collect();

        let finalize_task: Task = {
            let lifecycle = lifecycle.clone();
            let id = id.clone();
            let partition = partition.clone();
            Arc::new(move || finalize(&lifecycle, &id, &partition, token).map(|_| ()))
        };

        if let Err(err) = enqueue_fan_out(&self.dispatcher, queue, units, finalize_task) {
            self.abandon_attempt(
                lifecycle,
                &id,
                partition,
                token,
                format!("failed to schedule range units: {}", err),
            )?;
            return Err(err.into());
        }

        info!(
            migration = %id,
            partition = %partition,
            attempt = %token,
            backend = %self.name,
            queue,
            ranges = ranges.len(),
            "mapper migration scheduled"
        );
        Ok(token)
    }
}

/// Backends by identifier, with an optional default
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
    default: Option<String>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend; the first one registered becomes the default
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> MigrationResult<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(MigrationError::configuration(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Make a registered backend the default
    pub fn set_default(&mut self, name: &str) -> MigrationResult<()> {
        if !self.backends.contains_key(name) {
            return Err(MigrationError::configuration(format!(
                "Default backend '{}' is not registered",
                name
            )));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    /// Backend for a migration: its override if set, else the default
    pub fn resolve(&self, requested: Option<&str>) -> MigrationResult<Arc<dyn Backend>> {
        let name = requested.or(self.default.as_deref()).ok_or_else(|| {
            MigrationError::configuration("No backend configured and no default backend set")
        })?;
        self.backends.get(name).cloned().ok_or_else(|| {
            MigrationError::configuration(format!("Backend '{}' is not registered", name))
        })
    }
}
