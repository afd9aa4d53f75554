//! # Migration Errors
//!
//! Caller-visible failures of the lifecycle engine, the record stores and the
//! task dispatchers. Failures of user-supplied operations are not represented
//! here: they are recorded on the migration record and never propagated.

use thiserror::Error;

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Result type for record store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for task dispatch
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Migration error types
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A record already exists for this migration on this partition
    #[error("Migration '{key}' has already been started on partition '{partition}'")]
    AlreadyStarted { key: String, partition: String },

    /// A declared dependency has no applied record
    #[error(
        "Migration '{key}' depends on migration '{dependency}', which has not yet been applied \
         on partition '{partition}'"
    )]
    DependencyNotApplied {
        key: String,
        dependency: String,
        partition: String,
    },

    /// Code guarded by a migration ran before that migration was applied
    #[error("Migration '{key}' is required but has not been applied on partition '{partition}'")]
    RequiredMigrationNotApplied { key: String, partition: String },

    /// The partition is unknown or not allowed for this migration
    #[error("Invalid partition '{partition}': {reason}")]
    InvalidPartition { partition: String, reason: String },

    /// Backend, queue or other deployment configuration cannot be resolved
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Namespace or name does not match the identifier grammar
    #[error("Invalid migration identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    /// No definition registered under this key
    #[error("Migration '{key}' not found")]
    MigrationNotFound { key: String },

    /// A definition with this key is already registered
    #[error("Migration '{key}' is already registered")]
    DuplicateMigration { key: String },

    /// Operator action on a record that does not exist
    #[error("No record exists for migration '{key}' on partition '{partition}'")]
    RecordNotFound { key: String, partition: String },

    /// Operator action refused because the attempt is still running
    #[error(
        "Migration '{key}' is still running on partition '{partition}'; use force to delete anyway"
    )]
    AttemptInProgress { key: String, partition: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl MigrationError {
    /// Stable error code for operator surfaces
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyStarted { .. } => "ALREADY_STARTED",
            Self::DependencyNotApplied { .. } => "DEPENDENCY_NOT_APPLIED",
            Self::RequiredMigrationNotApplied { .. } => "REQUIRED_MIGRATION_NOT_APPLIED",
            Self::InvalidPartition { .. } => "INVALID_PARTITION",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            Self::MigrationNotFound { .. } => "MIGRATION_NOT_FOUND",
            Self::DuplicateMigration { .. } => "DUPLICATE_MIGRATION",
            Self::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            Self::AttemptInProgress { .. } => "ATTEMPT_IN_PROGRESS",
            Self::Store(_) => "STORE_ERROR",
            Self::Dispatch(_) => "DISPATCH_ERROR",
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Record store failures
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Conditional create lost against an existing record
    #[error("Record '{key}' already exists on partition '{partition}'")]
    AlreadyExists { key: String, partition: String },

    /// Temporary failure (contention, timeout, unavailable backend); safe to retry
    #[error("Transient store failure: {message}")]
    Transient { message: String },

    /// No store is configured for the partition
    #[error("No record store configured for partition '{partition}'")]
    UnknownPartition { partition: String },

    /// Persisted state could not be read or written
    #[error("Store I/O failure: {message}")]
    Io { message: String },

    /// Persisted state could not be decoded
    #[error("Corrupt store state: {message}")]
    Corrupt { message: String },

    #[error("Internal store error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub(crate) fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub(crate) fn poisoned() -> Self {
        Self::Internal {
            message: "store lock poisoned".to_string(),
        }
    }
}

/// Task dispatch failures
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Queue name empty or unknown to the dispatcher
    #[error("Invalid queue '{queue}'")]
    InvalidQueue { queue: String },

    /// The dispatcher has been shut down or its runtime is gone
    #[error("Dispatcher unavailable: {message}")]
    Unavailable { message: String },
}

/// Failure reported by a scheduled task back to its dispatcher
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The dispatcher should run the task again
    #[error("retryable: {0}")]
    Retry(String),

    /// The task cannot succeed; do not retry
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Self::Retry(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

impl From<MigrationError> for TaskError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Store(store) => store.into(),
            other => Self::Fatal(other.to_string()),
        }
    }
}
