//! modhost command line

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use modhost::config::HostConfig;
use modhost::module::registry::{ModuleDiscovery, RegistryEvent};
use modhost::module::{MessageBus, ModuleRegistry, ProcessSupervisor, RegistryOptions};
use modhost::utils::{init_logging_from_config, wait_for_shutdown_signal};

#[derive(Parser, Debug)]
#[command(name = "modhost", version, about = "Process-isolated module host")]
struct Cli {
    /// Configuration file (.json or .toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory scanned for modules
    #[arg(long, global = true)]
    modules_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover and load modules, run until SIGINT/SIGTERM
    Run {
        /// Root for per-module data directories
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print discovered module descriptors as JSON
    List,
}

fn load_config(cli: &Cli) -> anyhow::Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::from_file(path)
            .with_context(|| format!("failed to read config {:?}", path))?,
        None => HostConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(dir) = &cli.modules_dir {
        config.modules.modules_dir = dir.clone();
    }
    if let Command::Run {
        data_dir: Some(dir),
    } = &cli.command
    {
        config.modules.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging_from_config(Some(&config.logging));

    match cli.command {
        Command::List => list(&config),
        Command::Run { .. } => run(config).await,
    }
}

fn list(config: &HostConfig) -> anyhow::Result<()> {
    let descriptors: Vec<_> = ModuleDiscovery::new(&config.modules.modules_dir)
        .discover_modules()?
        .into_iter()
        .map(|m| m.into_descriptor())
        .collect();
    println!("{}", serde_json::to_string_pretty(&descriptors)?);
    Ok(())
}

async fn run(config: HostConfig) -> anyhow::Result<()> {
    info!("Starting modhost with modules from {:?}", config.modules.modules_dir);

    let bus = MessageBus::coordinator();
    let supervisor = Arc::new(ProcessSupervisor::new(
        bus.clone(),
        config.modules.data_dir.clone(),
    ));
    let registry = ModuleRegistry::new(
        bus,
        supervisor,
        RegistryOptions::from_config(&config.modules),
    )
    .await?;

    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RegistryEvent::Crashed { module_id, code } = event {
                error!("Module {} crashed with code {:?}", module_id, code);
            }
        }
    });

    let found = registry.discover().await?;
    info!("Discovered {} modules", found.len());
    let summary = registry.load_all().await?;
    for (module_id, error) in &summary.failed {
        warn!("Module {} not loaded: {}", module_id, error);
    }
    info!("{} modules running", summary.loaded.len());

    wait_for_shutdown_signal().await;
    info!("Shutting down");
    registry.shutdown().await;
    Ok(())
}
