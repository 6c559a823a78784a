use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "rollsync")]
#[command(about = "Offline-first attendance queue and sync for roll-call devices")]
#[command(long_about = "rollsync - offline-first queue and sync

Captures registrations, verifications, and record edits while offline,
keeps them in a durable local queue, and uploads them to the server of
record when connectivity returns. Reference data (students and
organizations) is cached locally so the device keeps working offline.

QUICK START:
  rollsync queue status          Show what is waiting to upload
  rollsync sync run              Run one sync cycle now
  rollsync sync daemon           Sync in the background until Ctrl-C
  rollsync cache status          Show cache age and offline readiness

OUTPUT FORMATS:
  --output pretty    Human-readable colored output (default)
  --output json      Machine-readable JSON for scripting

For more information on a specific command, run:
  rollsync <command> --help")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Output format for command results
    ///
    /// Use 'pretty' for human-readable colored output,
    /// or 'json' for machine-readable output suitable for scripting.
    /// Defaults to general.default_output from the config file.
    #[arg(short, long, value_enum, global = true)]
    pub output: Option<OutputFormat>,

    /// Data directory (defaults to ~/.rollsync)
    #[arg(long, env = "ROLLSYNC_HOME", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (defaults to <data-dir>/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. 'info' or 'rollsync=debug' (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for command results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable colored output.
    #[default]
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and manage the operation queue
    ///
    /// # Examples
    ///
    ///   rollsync queue status
    ///   rollsync queue list --status failed
    ///   rollsync queue add verification '{"roll_number":"R-1","matched":true,"verified_at":"2024-05-01T08:00:00Z"}'
    ///   rollsync queue retry --all
    #[command(alias = "q")]
    Queue(QueueArgs),

    /// Upload queued operations to the server
    ///
    /// # Examples
    ///
    ///   rollsync sync run
    ///   rollsync sync daemon --interval 10
    #[command(alias = "s")]
    Sync(SyncArgs),

    /// Inspect and refresh the reference-data cache
    ///
    /// # Examples
    ///
    ///   rollsync cache status
    ///   rollsync cache refresh --scope ORG-7
    #[command(alias = "c")]
    Cache(CacheArgs),

    /// Generate shell completions
    ///
    /// Example: rollsync completions bash > ~/.bash_completion.d/rollsync
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Arguments for the queue command.
#[derive(Args)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub command: QueueCommands,
}

/// Queue subcommands.
#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show queue statistics
    ///
    /// Pending counts per type, syncing, synced, and failed totals.
    Status,

    /// List queued operations
    List {
        /// Filter by status (pending, syncing, synced, failed, cancelled)
        #[arg(long, short = 's')]
        status: Option<String>,

        /// Maximum operations to show
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },

    /// Queue an operation
    ///
    /// The payload is the JSON body of the operation and must carry a
    /// non-empty roll_number.
    Add {
        /// Operation type (registration, verification, record-update)
        kind: String,

        /// JSON payload
        payload: String,
    },

    /// Reset terminally failed operations to pending
    Retry {
        /// Reset every failed operation
        #[arg(long)]
        all: bool,

        /// Specific operation ID to reset
        id: Option<i64>,
    },

    /// Cancel a pending or failed operation
    Cancel {
        /// Operation ID
        id: i64,
    },

    /// Purge synced and cancelled operations past retention
    Clean {
        /// Retention in days (defaults to sync.retention_days)
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

/// Arguments for the sync command.
#[derive(Args)]
pub struct SyncArgs {
    #[command(subcommand)]
    pub command: SyncCommands,
}

/// Sync subcommands.
#[derive(Subcommand)]
pub enum SyncCommands {
    /// Run one full sync cycle now
    ///
    /// Uploads registrations, verifications, and record updates in that
    /// order, refreshes reference data, and purges finished operations.
    Run,

    /// Sync in the background until interrupted
    ///
    /// Runs on an interval, on reconnect, and once at start when online.
    /// Ctrl-C waits for an in-flight run before exiting.
    Daemon {
        /// Minutes between runs (defaults to sync.interval_minutes)
        #[arg(long)]
        interval: Option<u64>,
    },
}

/// Arguments for the cache command.
#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

/// Cache subcommands.
#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache age, size, and offline readiness
    Status,

    /// Download reference data now
    Refresh {
        /// Scope to download (defaults to server.scope_id)
        #[arg(long)]
        scope: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_queue_add() {
        let cli = Cli::try_parse_from([
            "rollsync",
            "-o",
            "json",
            "queue",
            "add",
            "verification",
            r#"{"roll_number":"R-1"}"#,
        ])
        .unwrap();

        assert_eq!(cli.output, Some(OutputFormat::Json));
        match cli.command {
            Commands::Queue(QueueArgs {
                command: QueueCommands::Add { kind, payload },
            }) => {
                assert_eq!(kind, "verification");
                assert!(payload.contains("R-1"));
            }
            _ => panic!("expected queue add"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rollsync",
            "sync",
            "daemon",
            "--interval",
            "10",
            "--data-dir",
            "/tmp/rs",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/rs")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(
            cli.command,
            Commands::Sync(SyncArgs {
                command: SyncCommands::Daemon { interval: Some(10) }
            })
        ));
    }
}
