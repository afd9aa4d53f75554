//! # Migration Definitions
//!
//! A definition is an immutable configuration ([`MigrationConfig`]) plus the
//! behaviour that makes it a simple or a mapper migration. Definitions carry
//! no state; everything about a run lives in the migration record.

use std::fmt;
use std::sync::Arc;

use super::errors::MigrationResult;
use super::key::{MigrationId, Partition};
use super::range::{KeySplitter, MapperItem, RecordSet};

/// Operation of a simple migration, run once per partition
pub type SimpleOperation = Arc<dyn Fn(&Partition) -> anyhow::Result<()> + Send + Sync>;

/// Operation applied to each item of a mapper migration
pub type ItemOperation = Arc<dyn Fn(&MapperItem, &Partition) -> anyhow::Result<()> + Send + Sync>;

/// Produces the record set a mapper visits on a partition
pub type RecordSetFactory = Arc<dyn Fn(&Partition) -> Arc<dyn RecordSet> + Send + Sync>;

/// Static configuration of a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub id: MigrationId,

    /// Human-readable summary shown to operators
    pub description: String,

    /// Migrations that must be applied (on the same partition) first
    pub dependencies: Vec<MigrationId>,

    /// Backend identifier overriding the configured default
    pub backend: Option<String>,

    /// Queue name overriding the configured default
    pub queue: Option<String>,

    /// Partitions this migration may run on; `None` means all configured
    pub allowed_partitions: Option<Vec<Partition>>,
}

impl MigrationConfig {
    pub fn new(id: MigrationId) -> Self {
        Self {
            id,
            description: String::new(),
            dependencies: Vec::new(),
            backend: None,
            queue: None,
            allowed_partitions: None,
        }
    }

    /// Whether the migration may run on `partition`, given the configured set
    pub fn allows(&self, partition: &Partition) -> bool {
        self.allowed_partitions
            .as_ref()
            .map_or(true, |allowed| allowed.contains(partition))
    }
}

/// What a migration does
#[derive(Clone)]
pub enum MigrationKind {
    /// One unit of work
    Simple { operation: SimpleOperation },

    /// One operation per item, fanned out over key ranges
    Mapper {
        record_set: RecordSetFactory,
        operation: ItemOperation,
        /// Overrides the splitter chosen from the record set's key kind
        key_splitter: Option<Arc<dyn KeySplitter>>,
    },
}

impl MigrationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "simple",
            Self::Mapper { .. } => "mapper",
        }
    }
}

/// A registered migration
#[derive(Clone)]
pub struct Migration {
    config: MigrationConfig,
    kind: MigrationKind,
}

impl Migration {
    /// A simple migration
    pub fn simple<F>(namespace: &str, name: &str, operation: F) -> MigrationResult<Self>
    where
        F: Fn(&Partition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Ok(Self {
            config: MigrationConfig::new(MigrationId::new(namespace, name)?),
            kind: MigrationKind::Simple {
                operation: Arc::new(operation),
            },
        })
    }

    /// A mapper migration
    pub fn mapper<R, F>(
        namespace: &str,
        name: &str,
        record_set: R,
        operation: F,
    ) -> MigrationResult<Self>
    where
        R: Fn(&Partition) -> Arc<dyn RecordSet> + Send + Sync + 'static,
        F: Fn(&MapperItem, &Partition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Ok(Self {
            config: MigrationConfig::new(MigrationId::new(namespace, name)?),
            kind: MigrationKind::Mapper {
                record_set: Arc::new(record_set),
                operation: Arc::new(operation),
                key_splitter: None,
            },
        })
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = description.into();
        self
    }

    /// Declare a dependency on `namespace:name`
    pub fn depends_on(mut self, namespace: &str, name: &str) -> MigrationResult<Self> {
        self.config.dependencies.push(MigrationId::new(namespace, name)?);
        Ok(self)
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.config.backend = Some(backend.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = Some(queue.into());
        self
    }

    pub fn allowed_partitions<I, P>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Partition>,
    {
        self.config.allowed_partitions = Some(partitions.into_iter().map(Into::into).collect());
        self
    }

    /// Custom key splitter; ignored for simple migrations
    pub fn key_splitter(mut self, splitter: Arc<dyn KeySplitter>) -> Self {
        if let MigrationKind::Mapper { key_splitter, .. } = &mut self.kind {
            *key_splitter = Some(splitter);
        }
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn kind(&self) -> &MigrationKind {
        &self.kind
    }

    pub fn id(&self) -> &MigrationId {
        &self.config.id
    }

    pub fn key(&self) -> String {
        self.config.id.key()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("config", &self.config)
            .field("kind", &self.kind.name())
            .finish()
    }
}
