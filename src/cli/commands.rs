//! CLI command implementations
//!
//! Commands operate on the file-backed record store named by the config's
//! `state_file`. Migration definitions live in the host application, so the
//! CLI works from keys alone: it can inspect, reset and fake records but not
//! launch migrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::MassMigrationConfig;
use crate::migrations::{
    Lifecycle, MigrationId, MigrationRecord, MigrationStatus, Partition, RecordCache, RecordStore,
    FileRecordStore, TtlCache,
};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Main CLI entry point
///
/// Parses arguments, runs the command and writes its JSON response.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let response = execute(&cli.config, cli.command)?;
    write_response(response)
}

/// Run a command against the config at `config_path` and return its response
pub fn execute(config_path: &Path, command: Command) -> CliResult<Value> {
    let config = MassMigrationConfig::load(config_path)?;
    let context = Context::open(config_path, config)?;

    match command {
        Command::List { partition } => context.list(partition.as_deref()),
        Command::Show { key, partition } => context.show(&key, partition.as_deref()),
        Command::Delete {
            key,
            partition,
            yes,
            force,
        } => {
            if !yes {
                return Err(CliError::confirmation_required("delete a migration record"));
            }
            context.delete(&key, partition.as_deref(), force)
        }
        Command::Fake {
            key,
            partition,
            yes,
        } => {
            if !yes {
                return Err(CliError::confirmation_required("fake a migration as applied"));
            }
            context.fake(&key, partition.as_deref())
        }
    }
}

/// Relative state files resolve against the config file's directory
fn state_file_path(config_path: &Path, state_file: &Path) -> PathBuf {
    if state_file.is_absolute() {
        return state_file.to_path_buf();
    }
    config_path
        .parent()
        .map(|dir| dir.join(state_file))
        .unwrap_or_else(|| state_file.to_path_buf())
}

fn record_json(record: &MigrationRecord) -> Value {
    json!({
        "key": record.key,
        "partition": record.partition,
        "status": record.status(),
        "attempt_token": record.attempt_token,
        "initiated_at": record.initiated_at,
        "initiated_by": record.initiated_by,
        "applied_at": record.applied_at(),
        "last_error": record.last_error,
        "was_faked": record.was_faked,
    })
}

struct Context {
    config: MassMigrationConfig,
    store: Arc<FileRecordStore>,
    lifecycle: Lifecycle,
}

impl Context {
    fn open(config_path: &Path, config: MassMigrationConfig) -> CliResult<Self> {
        let state_file = config
            .state_file
            .as_deref()
            .ok_or_else(|| CliError::config_error("state_file must be set to use the CLI"))?;
        let store = Arc::new(FileRecordStore::open(state_file_path(config_path, state_file))?);

        let cache = RecordCache::new(Arc::new(TtlCache::new()), store.clone(), config.cache_ttl());
        let lifecycle = Lifecycle::new(store.clone(), cache, config.retry.clone());
        Ok(Self {
            config,
            store,
            lifecycle,
        })
    }

    fn partition(&self, partition: Option<&str>) -> CliResult<Partition> {
        Ok(self.config.resolve_partition(partition)?)
    }

    fn list(&self, partition: Option<&str>) -> CliResult<Value> {
        let partitions = match partition {
            Some(_) => vec![self.partition(partition)?],
            None => self.config.partitions(),
        };

        let mut listed = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let records: Vec<Value> = self.store.list(&partition)?.iter().map(record_json).collect();
            listed.push(json!({
                "partition": partition,
                "records": records,
            }));
        }
        Ok(json!({ "partitions": listed }))
    }

    fn show(&self, key: &str, partition: Option<&str>) -> CliResult<Value> {
        let id = MigrationId::parse(key)?;
        let partition = self.partition(partition)?;
        let record = self.lifecycle.record(&id, &partition)?;

        Ok(json!({
            "key": id.key(),
            "partition": partition,
            "status": MigrationStatus::of(record.as_ref()),
            "record": record.as_ref().map(record_json),
        }))
    }

    fn delete(&self, key: &str, partition: Option<&str>, force: bool) -> CliResult<Value> {
        let id = MigrationId::parse(key)?;
        let partition = self.partition(partition)?;
        let deleted = self.lifecycle.delete(&id, &partition, force)?;

        Ok(json!({
            "deleted": true,
            "key": id.key(),
            "partition": partition,
            "record": record_json(&deleted),
        }))
    }

    fn fake(&self, key: &str, partition: Option<&str>) -> CliResult<Value> {
        let id = MigrationId::parse(key)?;
        let partition = self.partition(partition)?;
        let record = self.lifecycle.fake_applied(&id, &partition)?;

        Ok(json!({
            "faked": true,
            "record": record_json(&record),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::errors::CliErrorCode;
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_config(temp_dir: &TempDir) -> PathBuf {
        let config_path = temp_dir.path().join("massmigrate.toml");
        fs::write(
            &config_path,
            r#"
partitions = ["default", "analytics"]
state_file = "state/records.json"
"#,
        )
        .unwrap();
        config_path
    }

    fn store(temp_dir: &TempDir) -> FileRecordStore {
        FileRecordStore::open(temp_dir.path().join("state").join("records.json")).unwrap()
    }

    fn show(config_path: &Path, key: &str) -> Value {
        execute(
            config_path,
            Command::Show {
                key: key.to_string(),
                partition: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_show_missing_record() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);

        let response = show(&config_path, "app1:0001_backfill");
        assert_eq!(response["status"], "NOT_STARTED");
        assert!(response["record"].is_null());
        assert_eq!(response["partition"], "default");
    }

    #[test]
    fn test_fake_then_list() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);

        let response = execute(
            &config_path,
            Command::Fake {
                key: "app1:0001_backfill".to_string(),
                partition: Some("analytics".to_string()),
                yes: true,
            },
        )
        .unwrap();
        assert_eq!(response["record"]["status"], "APPLIED");
        assert_eq!(response["record"]["was_faked"], true);

        let listed = execute(&config_path, Command::List { partition: None }).unwrap();
        let partitions = listed["partitions"].as_array().unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0]["records"].as_array().unwrap().len(), 0);
        assert_eq!(partitions[1]["records"][0]["key"], "app1:0001_backfill");
    }

    #[test]
    fn test_mutations_require_confirmation() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);

        let err = execute(
            &config_path,
            Command::Fake {
                key: "app1:0001_backfill".to_string(),
                partition: None,
                yes: false,
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfirmationRequired);
        assert_eq!(show(&config_path, "app1:0001_backfill")["status"], "NOT_STARTED");
    }

    #[test]
    fn test_delete_errored_record() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);
        {
            let store = store(&temp_dir);
            let mut record =
                MigrationRecord::new_attempt("app1:0001_backfill", Partition::new("default"));
            record.has_error = true;
            record.last_error = "bad data".to_string();
            store.create(record).unwrap();
        }
        assert_eq!(show(&config_path, "app1:0001_backfill")["status"], "ERRORED");

        let response = execute(
            &config_path,
            Command::Delete {
                key: "app1:0001_backfill".to_string(),
                partition: None,
                yes: true,
                force: false,
            },
        )
        .unwrap();
        assert_eq!(response["deleted"], true);
        assert_eq!(response["record"]["last_error"], "bad data");
        assert_eq!(show(&config_path, "app1:0001_backfill")["status"], "NOT_STARTED");
    }

    #[test]
    fn test_delete_running_record_needs_force() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);
        store(&temp_dir)
            .create(MigrationRecord::new_attempt(
                "app1:0001_backfill",
                Partition::new("default"),
            ))
            .unwrap();

        let delete = |force| Command::Delete {
            key: "app1:0001_backfill".to_string(),
            partition: None,
            yes: true,
            force,
        };

        let err = execute(&config_path, delete(false)).unwrap_err();
        assert_eq!(err.error_code(), "ATTEMPT_IN_PROGRESS");
        execute(&config_path, delete(true)).unwrap();
    }

    #[test]
    fn test_errors() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);

        let err = execute(
            &config_path,
            Command::Show {
                key: "not-a-key".to_string(),
                partition: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_IDENTIFIER");

        let err = execute(
            &config_path,
            Command::List {
                partition: Some("elsewhere".to_string()),
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);

        let missing = temp_dir.path().join("missing.toml");
        let err = execute(&missing, Command::List { partition: None }).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_IO_ERROR");
    }

    #[test]
    fn test_state_file_is_required() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("massmigrate.toml");
        fs::write(&config_path, "partitions = [\"default\"]\n").unwrap();

        let err = execute(&config_path, Command::List { partition: None }).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
    }
}
