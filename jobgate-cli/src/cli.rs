//! Command line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "jobgate", version, about = "Shared-store API, bot and worker processes")]
pub struct Cli {
    /// Read revisions from this directory instead of the ones built into the binary.
    #[arg(long, global = true, env = "JOBGATE_MIGRATIONS_DIR")]
    pub migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API
    Api,
    /// Run the Telegram bot
    Bot,
    /// Run the background worker
    Worker {
        /// Claim one batch, process it and exit
        #[arg(long)]
        once: bool,
    },
    /// Run api, worker and bot as child processes and stop them together
    RunAll,
    /// Apply or revert schema revisions
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Inspect and requeue work units
    Units {
        #[command(subcommand)]
        action: UnitsAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum MigrateAction {
    /// Move forward to TARGET (`head`, a revision id or `+N`)
    Upgrade {
        #[arg(default_value = "head")]
        target: String,
    },
    /// Move back to TARGET (`base`, a revision id or `-N`)
    Downgrade {
        #[arg(default_value = "-1", allow_hyphen_values = true)]
        target: String,
    },
    /// Print the store's current revision
    Current,
    /// List revisions and which are applied
    History,
    /// Write a new revision pair
    Revision(RevisionArgs),
}

#[derive(Args, Debug)]
pub struct RevisionArgs {
    /// Short description, also used in the file name
    #[arg(short, long)]
    pub message: String,

    /// Fill the scripts with the difference between the declared model and the store
    #[arg(long)]
    pub autogenerate: bool,

    /// Directory to write into (defaults to --migrations-dir, then `migrations`)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum UnitsAction {
    /// Unit counts per state
    Stats,
    /// One unit with its attempts, as JSON
    Show { id: i64 },
    /// Recent units, as JSON
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Put a terminally failed unit back in the queue
    Requeue { id: i64 },
}
