//! ---
//! luo_section: "01-core-functionality"
//! luo_subsection: "binary"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Binary entrypoint for the R-LUO daemon."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use r_luo_api::{spawn_api_server, ApiServer, ApiState};
use r_luo_common::{init_tracing, AppConfig};
use r_luo_core::LiveUpdateOrchestrator;
use r_luo_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use r_luo_registry::{file_module_specs, ModuleRegistry};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/r-luo.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "R-LUO live update daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", env = "R_LUO_CONFIG", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the process identifier reported to sibling workers")]
    process_id: Option<String>,

    #[arg(long, value_name = "ADDR", help = "Override the admin API listen address")]
    api_listen: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the orchestrator")]
    Run,
    #[command(about = "Validate configuration and module sources, then print the reload order")]
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();
    if let Some(process_id) = cli.process_id {
        config.node.process_id = Some(process_id);
    }
    if let Some(listen) = cli.api_listen {
        config.api.listen = listen;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("r-luod", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config, load_duration.as_secs_f64()).await?
        }
        Commands::Check => {
            r_luo_common::init_cli();
            let registry = build_registry(&config)?;
            println!("{}", serde_json::to_string_pretty(&describe(&registry)?)?);
        }
    }
    Ok(())
}

fn build_registry(config: &AppConfig) -> Result<Arc<ModuleRegistry>> {
    let registry = Arc::new(ModuleRegistry::new());
    let specs = file_module_specs(&config.modules).context("failed to open module sources")?;
    registry
        .register_all(specs)
        .context("failed to register configured modules")?;
    Ok(registry)
}

fn describe(registry: &ModuleRegistry) -> Result<serde_json::Value> {
    let order = registry.dependency_order(&registry.names())?;
    let modules: Vec<_> = order
        .iter()
        .map(|d| {
            json!({
                "name": d.name,
                "kind": d.kind,
                "fingerprint": d.fingerprint,
                "depends_on": d.dependency_names,
            })
        })
        .collect();
    Ok(json!({ "reload_order": modules }))
}

async fn run_daemon(config: AppConfig, config_load_seconds: f64) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let api_settings = config.api.clone();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(config_load_seconds);
    daemon_metrics.inc_start();

    let registry = build_registry(&config)?;
    info!(modules = registry.len(), "module registry ready");

    let service = Arc::new(
        LiveUpdateOrchestrator::new(config, registry)
            .metrics_registry(metrics_registry.clone())
            .start()?,
    );

    let metrics_server = if metrics_settings.enabled {
        info!(address = %metrics_settings.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry, metrics_settings.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mut api_server: Option<ApiServer> = None;
    if api_settings.enabled {
        let state = Arc::new(ApiState::new(Arc::clone(&service)));
        match spawn_api_server(state, api_settings.listen) {
            Ok(server) => api_server = Some(server),
            Err(err) => warn!(error = %err, "failed to start api server"),
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!(generation = service.generation(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    service.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn check_reports_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.json"), r#"{"limit": 1}"#).unwrap();
        fs::write(dir.path().join("rules.json"), r#"{"allow": ["a"]}"#).unwrap();
        let source = format!(
            r#"
            [modules.rules]
            kind = "rule"
            source = "{rules}"
            depends_on = ["base"]

            [modules.base]
            source = "{base}"
            "#,
            rules = dir.path().join("rules.json").display(),
            base = dir.path().join("base.json").display(),
        );
        let config: AppConfig = source.parse().unwrap();

        let registry = build_registry(&config).unwrap();
        let report = describe(&registry).unwrap();
        assert_eq!(report["reload_order"][0]["name"], "base");
        assert_eq!(report["reload_order"][1]["name"], "rules");
        assert_eq!(report["reload_order"][1]["kind"], "rule");
    }

    #[test]
    fn unreadable_module_source_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let source = format!(
            "[modules.limits]\nsource = \"{}\"\n",
            dir.path().join("limits.json").display()
        );
        let config: AppConfig = source.parse().unwrap();
        assert!(build_registry(&config).is_err());
    }
}
