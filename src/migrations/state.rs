//! # Migration State
//!
//! The persistent record of one attempt of one migration on one partition.
//! Absence of a record means the migration was never started (or its last
//! attempt was cleared by an operator); status is derived, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::key::Partition;

/// Derived status of a migration on a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    /// No record exists
    NotStarted,
    /// Record exists, not applied, no error
    Running,
    /// A work unit reported a failure
    Errored,
    /// All work units completed for the current attempt
    Applied,
}

impl MigrationStatus {
    /// Status for an optional record
    pub fn of(record: Option<&MigrationRecord>) -> Self {
        record.map(MigrationRecord::status).unwrap_or(Self::NotStarted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Errored => "ERRORED",
            Self::Applied => "APPLIED",
        }
    }
}

/// Record of a started migration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// `namespace:name` key
    pub key: String,

    /// Partition this record tracks
    pub partition: Partition,

    /// Regenerated whenever the record is recreated
    pub attempt_token: Uuid,

    /// When the attempt was started
    pub initiated_at: DateTime<Utc>,

    /// Operator or process that started the attempt
    #[serde(default)]
    pub initiated_by: Option<String>,

    pub is_applied: bool,

    /// Stored value; see [`MigrationRecord::applied_at`]
    #[serde(default)]
    applied_at: Option<DateTime<Utc>>,

    pub has_error: bool,

    #[serde(default)]
    pub last_error: String,

    /// Marked applied by an operator without running
    #[serde(default)]
    pub was_faked: bool,
}

impl MigrationRecord {
    /// Fresh record for a new attempt
    pub fn new_attempt(key: impl Into<String>, partition: Partition) -> Self {
        Self {
            key: key.into(),
            partition,
            attempt_token: Uuid::new_v4(),
            initiated_at: Utc::now(),
            initiated_by: None,
            is_applied: false,
            applied_at: None,
            has_error: false,
            last_error: String::new(),
            was_faked: false,
        }
    }

    /// Record for a migration an operator declares already satisfied
    pub fn faked(key: impl Into<String>, partition: Partition) -> Self {
        let mut record = Self::new_attempt(key, partition);
        record.was_faked = true;
        record.mark_applied();
        record
    }

    pub fn status(&self) -> MigrationStatus {
        if self.has_error {
            MigrationStatus::Errored
        } else if self.is_applied {
            MigrationStatus::Applied
        } else {
            MigrationStatus::Running
        }
    }

    /// Started, not applied and not errored
    pub fn in_progress(&self) -> bool {
        !(self.is_applied || self.has_error)
    }

    /// When the migration was applied.
    ///
    /// Falls back to now for records that are applied but carry no stored
    /// timestamp.
    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        if self.is_applied && self.applied_at.is_none() {
            return Some(Utc::now());
        }
        self.applied_at
    }

    pub(crate) fn mark_applied(&mut self) {
        self.is_applied = true;
        if self.applied_at.is_none() {
            self.applied_at = Some(Utc::now());
        }
    }

    pub(crate) fn mark_errored(&mut self, reason: &str) {
        self.has_error = true;
        self.last_error = reason.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MigrationRecord {
        MigrationRecord::new_attempt("app1:0001_backfill", Partition::new("default"))
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(MigrationStatus::of(None), MigrationStatus::NotStarted);

        let mut rec = record();
        assert_eq!(rec.status(), MigrationStatus::Running);
        assert!(rec.in_progress());

        rec.mark_applied();
        assert_eq!(rec.status(), MigrationStatus::Applied);
        assert!(!rec.in_progress());

        rec.mark_errored("boom");
        assert_eq!(rec.status(), MigrationStatus::Errored);
    }

    #[test]
    fn test_new_attempts_have_distinct_tokens() {
        assert_ne!(record().attempt_token, record().attempt_token);
    }

    #[test]
    fn test_applied_at_is_lazily_derived() {
        let mut rec = record();
        assert!(rec.applied_at().is_none());

        // Applied without a stored timestamp (e.g. written by an older process)
        rec.is_applied = true;
        assert!(rec.applied_at().is_some());

        rec.mark_applied();
        let stored = rec.applied_at().unwrap();
        assert_eq!(rec.applied_at(), Some(stored));
    }

    #[test]
    fn test_faked_record() {
        let rec = MigrationRecord::faked("app1:0001_backfill", Partition::new("default"));
        assert!(rec.was_faked);
        assert!(rec.is_applied);
        assert_eq!(rec.status(), MigrationStatus::Applied);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&MigrationStatus::NotStarted).unwrap();
        assert_eq!(json, "\"NOT_STARTED\"");
        assert_eq!(MigrationStatus::Errored.as_str(), "ERRORED");
    }
}
