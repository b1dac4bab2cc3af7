//! Command-line definitions for the `keel` binary.

use clap::{Parser, Subcommand};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("KEEL_GIT_SHA"), ")");

/// Persistent cron/date job scheduler.
#[derive(Parser)]
#[command(name = "keel")]
#[command(version = VERSION)]
pub(crate) struct Cli {
    /// Configuration file (default: ~/.keel/keel.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler in the foreground until Ctrl-C (default)
    Run,

    /// Validate a cron expression and print its next fire times (UTC)
    Check {
        /// Cron expression, 5 to 7 fields
        expression: String,

        /// How many fire times to print
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Add a job to the database
    Add {
        /// Job name
        name: String,

        /// Registered task key, e.g. demo.echo
        #[arg(long)]
        task: String,

        /// Cron expression
        #[arg(long, conflicts_with = "at", required_unless_present = "at")]
        cron: Option<String>,

        /// One-shot fire time, RFC 3339
        #[arg(long)]
        at: Option<String>,

        /// Positional argument passed to the task (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Keyword arguments as a JSON object
        #[arg(long)]
        kwargs: Option<String>,

        #[arg(long, default_value = "default")]
        group: String,

        /// Collapse missed firings into one
        #[arg(long)]
        coalesce: bool,

        #[arg(long)]
        max_instances: Option<u32>,

        /// Hard timeout for one execution, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// List jobs
    List {
        /// Only jobs in this group
        #[arg(long)]
        group: Option<String>,
    },

    /// Remove jobs by id
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Print execution history, newest first
    History {
        /// Only records of this job
        job_id: Option<String>,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Delete finalized records instead of printing them
        #[arg(long)]
        purge: bool,
    },
}
