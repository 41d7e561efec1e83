//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "binary"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Binary entrypoint for the R-APM agent daemon."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use r_apm_common::config::AgentConfig;
use r_apm_common::identity::AgentIdentity;
use r_apm_common::logging::init_tracing;
use r_apm_core::{
    ChannelManager, CommandExecutorService, CommandService,
    ConfigurationDiscoveryCommandExecutor, ConfigurationDiscoveryService, InstanceNameGenerator,
    ServiceManager,
};
use r_apm_proto::AgentCommand;
use r_apm_metrics::{new_registry, spawn_http_server, AgentMetrics};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "R-APM agent daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the agent runtime")]
    Run,
    #[command(about = "Validate configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/agent.toml"));
    candidates.push(PathBuf::from("configs/example.dev.toml"));

    let loaded = AgentConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::CheckConfig => {
            println!(
                "Configuration OK\nSource: {}\nService: {}\nCollector: {}",
                loaded.source.display(),
                config.agent.service_name,
                config.collector.backend_service
            );
            Ok(())
        }
    }
}

async fn run_daemon(config: AgentConfig) -> Result<()> {
    init_tracing("r-apmd", &config.logging)?;
    let config = Arc::new(config);

    let (metrics, metrics_server) = if config.metrics.enabled {
        let registry = new_registry();
        let metrics = AgentMetrics::new(registry.clone())?;
        match spawn_http_server(registry, config.metrics.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "metrics exporter enabled");
                (Some(metrics), Some(server))
            }
            Err(err) => {
                warn!(error = %err, "failed to start metrics exporter; continuing without it");
                (Some(metrics), None)
            }
        }
    } else {
        info!("metrics exporter disabled by configuration");
        (None, None)
    };

    let identity = Arc::new(AgentIdentity::from_settings(&config.agent));
    let channel = ChannelManager::new(config.clone(), identity.clone(), metrics.clone());
    let discovery =
        ConfigurationDiscoveryService::new(config.clone(), channel.clone(), metrics.clone());
    let executors = Arc::new(CommandExecutorService::new().with_executor(
        AgentCommand::CONFIGURATION_DISCOVERY,
        Arc::new(ConfigurationDiscoveryCommandExecutor::new(discovery.clone())),
    ));
    let commands = CommandService::new(executors.clone(), metrics.clone());
    discovery.attach_scheduler(commands.clone());

    let manager = ServiceManager::new();
    manager.register(Arc::new(InstanceNameGenerator::new(identity)));
    manager.register(channel);
    manager.register(executors);
    manager.register(commands);
    manager.register(discovery);

    manager.boot().await?;
    info!(service = %config.agent.service_name, "agent running; waiting for termination signal");

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    manager.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
