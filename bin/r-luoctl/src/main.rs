//! ---
//! luo_section: "05-networking-external-interfaces"
//! luo_subsection: "binary"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Control CLI for operators interacting with a running R-LUO daemon."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;

use client::AdminClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "R-LUO operator control utility", long_about = None)]
struct Cli {
    /// Base URL of the daemon admin API.
    #[arg(
        long,
        env = "R_LUO_ENDPOINT",
        default_value = "http://127.0.0.1:8089",
        global = true
    )]
    endpoint: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show module versions, generation, and recent failures.
    Status,
    /// Scan for changes now and reload whatever changed.
    Check {
        /// Restrict the scan to one module.
        module: Option<String>,
    },
    /// List module fingerprints and generations.
    Versions,
    /// Force a reload of one module and its dependents.
    Reload { name: String },
    /// Scan every module, reload what changed, and fan out to sibling workers.
    ReloadAll,
    /// Restore a module from its backup archive.
    Rollback {
        name: String,
        /// Generation to restore; defaults to the newest backup.
        #[arg(long)]
        generation: Option<u64>,
    },
    /// Show the sync signal and each worker's last seen generation.
    WorkerSync,
    /// Rewrite the sync signal so every worker re-evaluates it.
    TriggerAllWorkers,
}

#[tokio::main]
async fn main() -> Result<()> {
    r_luo_common::init_cli();
    let cli = Cli::parse();
    let client = AdminClient::new(&cli.endpoint)?;
    let body = match cli.command {
        Commands::Status => client.status().await?,
        Commands::Check { module } => client.check(module.as_deref()).await?,
        Commands::Versions => client.versions().await?,
        Commands::Reload { name } => client.reload(&name).await?,
        Commands::ReloadAll => client.reload_all().await?,
        Commands::Rollback { name, generation } => client.rollback(&name, generation).await?,
        Commands::WorkerSync => client.worker_sync().await?,
        Commands::TriggerAllWorkers => client.trigger_all_workers().await?,
    };
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
