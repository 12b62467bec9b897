use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use geoanomaly_core::TaskStatus;

/// Geospatial time-series anomaly detection: scheduler, workers and tools.
///
/// Settings come from the environment (and `.env`); see `GEOANOMALY_PROFILE`
/// for profiled keys.
#[derive(Parser, Debug)]
#[command(name = "geoanomaly", version, about)]
pub struct Cli {
    /// Apply bundled PostgreSQL migrations before running.
    #[arg(long, global = true, env = "GEOANOMALY_MIGRATE")]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run periodic sweeps until interrupted.
    Scheduler,

    /// Run a single sweep and print its report.
    Sweep,

    /// Run the worker pool until interrupted.
    Worker {
        /// Concurrent evaluations (overrides WORKER_CONCURRENCY).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Submit re-scoring tasks for a historical range.
    Backfill {
        /// Restrict to one entity.
        #[arg(long)]
        entity: Option<String>,

        /// Exclusive start of the range (RFC 3339).
        #[arg(long)]
        from: DateTime<Utc>,

        /// Inclusive end of the range (RFC 3339).
        #[arg(long)]
        until: DateTime<Utc>,

        /// Window length per task, in hours.
        #[arg(long, default_value_t = 24)]
        step_hours: i64,
    },

    /// Bulk load observations from CSV into PostgreSQL.
    Import {
        /// CSV with columns entity_id,timestamp,value[,lon,lat].
        #[arg(long)]
        csv: PathBuf,
    },

    /// Evaluate a CSV in-process and print detected anomalies as JSON.
    Run {
        /// CSV with columns entity_id,timestamp,value[,lon,lat].
        #[arg(long)]
        csv: PathBuf,

        /// Pin "now" for reproducible output (RFC 3339).
        #[arg(long)]
        now: Option<DateTime<Utc>>,

        /// Only print records at or above this severity.
        #[arg(long)]
        min_severity: Option<f64>,
    },

    /// Print queue health, dead-letter depth and task status counts.
    Status,

    /// List task states held in the result cache.
    Tasks {
        /// Filter by status: pending, running, done, skipped, failed.
        #[arg(long)]
        status: Option<TaskStatus>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_tasks_status_filter() {
        let cli = Cli::try_parse_from(["geoanomaly", "tasks", "--status", "failed"]).unwrap();
        match cli.command {
            Command::Tasks { status } => assert_eq!(status, Some(TaskStatus::Failed)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_status() {
        let cli = Cli::try_parse_from(["geoanomaly", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn parses_backfill_range() {
        let cli = Cli::try_parse_from([
            "geoanomaly",
            "--migrate",
            "backfill",
            "--entity",
            "E1",
            "--from",
            "2024-01-01T00:00:00Z",
            "--until",
            "2024-01-08T00:00:00Z",
        ])
        .unwrap();
        assert!(cli.migrate);
        match cli.command {
            Command::Backfill {
                entity,
                step_hours,
                ..
            } => {
                assert_eq!(entity.as_deref(), Some("E1"));
                assert_eq!(step_hours, 24);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
