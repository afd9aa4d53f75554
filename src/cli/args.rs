//! CLI argument definitions using clap
//!
//! Commands:
//! - massmigrate --config <path> list [--partition <p>]
//! - massmigrate --config <path> show <key> [--partition <p>]
//! - massmigrate --config <path> delete <key> [--partition <p>] --yes [--force]
//! - massmigrate --config <path> fake <key> [--partition <p>] --yes
//!
//! Mutating commands require explicit confirmation.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// massmigrate - inspect and reset mass migration records
#[derive(Parser, Debug)]
#[command(name = "massmigrate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./massmigrate.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List migration records
    List {
        /// Only this partition (default: every configured partition)
        #[arg(long)]
        partition: Option<String>,
    },

    /// Show the record of one migration
    Show {
        /// Migration key, `namespace:name`
        key: String,

        /// Partition (default: the first configured partition)
        #[arg(long)]
        partition: Option<String>,
    },

    /// Delete a migration record so the migration can be launched again
    ///
    /// Requires confirmation. A running attempt is only deleted with --force.
    Delete {
        key: String,

        #[arg(long)]
        partition: Option<String>,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,

        /// Delete even if the attempt is still running
        #[arg(long)]
        force: bool,
    },

    /// Record a migration as applied without running it
    ///
    /// Requires confirmation.
    Fake {
        key: String,

        #[arg(long)]
        partition: Option<String>,

        /// Confirm the change
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
