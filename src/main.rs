use anyhow::{Context, Result};
use clap::Parser;
use sim_manager::config::{SimulationManagerConfig, DEFAULT_CONFIG_PATH};
use sim_manager::{Error, SimulationManager, WorkDir};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Worker agent executing simulation runs of parameter-sweep experiments.
#[derive(Debug, Parser)]
#[command(name = "simulation_manager", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stop after this many simulations (overrides the configuration).
    #[arg(long)]
    simulations_limit: Option<u32>,

    /// Directory holding the experiment working directories.
    #[arg(long, default_value = ".")]
    root_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SimulationManagerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Simulation Manager");
    info!("Information Service: {}", config.information_service_url);
    info!("Working directory root: {}", cli.root_dir.display());

    let mut manager = SimulationManager::from_config(config, WorkDir::new(&cli.root_dir))?;
    if cli.simulations_limit.is_some() {
        manager = manager.with_simulations_limit(cli.simulations_limit);
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, exiting...");
            std::process::exit(0);
        }
    });

    match manager.run().await {
        Ok(()) => {
            info!("Simulation Manager finished");
            Ok(())
        }
        Err(e @ Error::LimitReached(_)) => {
            info!("{}", e);
            std::process::exit(e.exit_code());
        }
        Err(e) => {
            error!("{}", e);
            if let Some(tail) = e.log_tail() {
                error!("Last lines of the simulation log:\n{}", tail);
            }
            std::process::exit(e.exit_code());
        }
    }
}
