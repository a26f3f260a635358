//! SiteSync CLI - capture field records offline and sync them later
//!
//! Every command works against the local store; `sync` pushes queued changes
//! when a remote store is configured and reachable.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::GlobalArgs;
use crate::commands::conflicts::{run_conflicts, run_dismiss, run_resolve};
use crate::commands::records::{
    run_attach, run_create, run_delete, run_list, run_show, run_update,
};
use crate::commands::sync::{run_retry, run_status, run_sync, run_wipe};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sitesync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let args = GlobalArgs::from_cli(&cli);

    match cli.command {
        Commands::Create { payload } => run_create(payload.as_deref(), &args).await,
        Commands::Update { id, payload } => run_update(&id, payload.as_deref(), &args).await,
        Commands::Delete { id } => run_delete(&id, &args).await,
        Commands::Attach { id, file, mime } => {
            run_attach(&id, &file, mime.as_deref(), &args).await
        }
        Commands::Show { id, json } => run_show(&id, json, &args).await,
        Commands::List {
            limit,
            offset,
            json,
        } => run_list(limit, offset, json, &args).await,
        Commands::Sync { json } => run_sync(json, &args).await,
        Commands::Status { json } => run_status(json, &args).await,
        Commands::Conflicts { all, json } => run_conflicts(all, json, &args).await,
        Commands::Resolve {
            id,
            strategy,
            merged,
        } => run_resolve(&id, strategy.into(), merged.as_deref(), &args).await,
        Commands::Dismiss { id } => run_dismiss(&id, &args).await,
        Commands::Retry => run_retry(&args).await,
        Commands::Wipe { yes } => run_wipe(yes, &args).await,
    }
}
