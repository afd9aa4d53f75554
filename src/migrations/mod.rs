//! # Mass Migrations
//!
//! Bulk data transformations that are too large for a single transaction,
//! run as independently scheduled work units across one or more data
//! partitions.
//!
//! # Lifecycle
//!
//! Each migration has at most one record per partition. The record's
//! presence and flags define the state:
//!
//! ```text
//! NOT_STARTED --start--> RUNNING --mark_applied--> APPLIED
//!                           |
//!                           +--mark_errored--> ERRORED --delete--> NOT_STARTED
//! ```
//!
//! Every attempt carries a fresh token. Work units check the token of the
//! current record before doing anything, so deleting and restarting a
//! migration logically cancels units still in flight from the old attempt.
//!
//! # Shapes
//!
//! - **Simple**: the attempt is started at launch, then one unit runs the
//!   operation and marks the result.
//! - **Mapper**: the attempt is started up front, the record set's key space
//!   is split into ranges, one unit runs per range and a finalize step marks
//!   the attempt applied once every range has completed.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use massmigrate::config::MassMigrationConfig;
//! use massmigrate::migrations::{
//!     BackendRegistry, InMemoryRecordStore, InlineDispatcher, Migration, MigrationService,
//!     TaskBackend, TtlCache,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MassMigrationConfig {
//!     task_queue: Some("migrations".to_string()),
//!     ..Default::default()
//! };
//! let mut backends = BackendRegistry::new();
//! backends.register(Arc::new(TaskBackend::new(
//!     "tasks",
//!     Arc::new(InlineDispatcher::default()),
//! )))?;
//!
//! let backfill = Migration::simple("app1", "0001_backfill", |_partition| Ok(()))?
//!     .description("Backfill display names");
//!
//! let service = MigrationService::from_config(
//!     &config,
//!     Arc::new(InMemoryRecordStore::new()),
//!     Arc::new(TtlCache::new()),
//!     backends,
//!     vec![backfill],
//! )?;
//! service.launch("app1:0001_backfill", None)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod definition;
pub mod dispatch;
pub mod enforcement;
pub mod errors;
pub mod key;
pub mod lifecycle;
pub mod range;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod service;
pub mod state;
pub mod store;

pub use backend::{Backend, BackendRegistry, TaskBackend};
pub use cache::{Clock, ManualClock, RecordCache, StateCache, SystemClock, TtlCache};
pub use definition::{Migration, MigrationConfig, MigrationKind};
pub use dispatch::{
    enqueue_fan_out, InlineDispatcher, QueueDispatcher, Task, TaskDispatcher, TokioDispatcher,
};
pub use enforcement::Enforcer;
pub use errors::{
    DispatchError, DispatchResult, MigrationError, MigrationResult, StoreError, StoreResult,
    TaskError,
};
pub use key::{MigrationId, Partition};
pub use lifecycle::{Lifecycle, MarkOutcome};
pub use range::{
    InMemoryRecordSet, ItemKey, KeyKind, KeyRange, KeySplitter, MapperItem, RecordSet,
};
pub use registry::MigrationRegistry;
pub use retry::RetryPolicy;
pub use runner::{ItemOutcome, RangeReport};
pub use service::{LaunchReceipt, MigrationDetail, MigrationOverview, MigrationService};
pub use state::{MigrationRecord, MigrationStatus};
pub use store::{FileRecordStore, InMemoryRecordStore, PartitionRouter, RecordStore};
