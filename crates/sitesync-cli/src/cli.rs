use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use sitesync_core::ResolutionStrategy;

#[derive(Parser)]
#[command(name = "sitesync")]
#[command(about = "Capture field records offline and sync them when a link is available")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Remote store base URL (overrides SITESYNC_REMOTE_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub remote_url: Option<String>,

    /// Bearer token for the remote store (overrides SITESYNC_REMOTE_TOKEN)
    #[arg(long, global = true, value_name = "TOKEN")]
    pub remote_token: Option<String>,

    /// Never contact the remote store
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record from a JSON object (reads stdin when omitted)
    #[command(alias = "new")]
    Create {
        /// Record payload, e.g. '{"site":"north"}'
        payload: Option<String>,
    },
    /// Replace a record's payload
    Update {
        /// Record ID or unique ID prefix
        id: String,
        /// New payload (reads stdin when omitted)
        payload: Option<String>,
    },
    /// Delete a record and its attachments
    Delete {
        /// Record ID or unique ID prefix
        id: String,
    },
    /// Attach a file to a record
    Attach {
        /// Record ID or unique ID prefix
        id: String,
        /// File to attach
        file: PathBuf,
        /// MIME type (guessed from the extension when omitted)
        #[arg(long, value_name = "TYPE")]
        mime: Option<String>,
    },
    /// Show one record
    Show {
        /// Record ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records, most recently updated first
    List {
        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Number of records to skip
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued changes to the remote store
    Sync {
        /// Output the pass report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue and sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sync conflicts
    Conflicts {
        /// Include resolved and dismissed conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a pending conflict
    Resolve {
        /// Conflict ID
        id: String,
        /// Which version wins
        #[arg(long, value_enum)]
        strategy: StrategyArg,
        /// Merged payload, required with `--strategy manual`
        #[arg(long, value_name = "JSON")]
        merged: Option<String>,
    },
    /// Dismiss a pending conflict and keep the local version
    Dismiss {
        /// Conflict ID
        id: String,
    },
    /// Retry queue items that ran out of attempts
    Retry,
    /// Erase all local data and start over with a new device id
    Wipe {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    LatestWins,
    LocalWins,
    RemoteWins,
    Manual,
}

impl From<StrategyArg> for ResolutionStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::LatestWins => Self::LatestWins,
            StrategyArg::LocalWins => Self::LocalWins,
            StrategyArg::RemoteWins => Self::RemoteWins,
            StrategyArg::Manual => Self::Manual,
        }
    }
}
