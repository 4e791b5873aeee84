mod cli;
mod demo_game;
mod episode_log;
mod evaluate;
mod game;
mod metrics;
mod orchestrator;
mod pool;
mod replay;
mod reporter;
mod self_play;

use crate::cli::Cli;
use crate::demo_game::NimGame;
use crate::game::Game;
use clap::Parser;
use spt_config::config::AppConfig;
use spt_core::net::LinearSpawner;
use spt_util::logging::setup_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

fn create_run_folder(config: &AppConfig) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let base_dir = PathBuf::from(&config.base_dir);
    std::fs::create_dir_all(&base_dir)?;

    let run_dir = base_dir.join(&config.run_name);

    if config.overwrite_run && run_dir.exists() {
        info!("Removing existing run directory: {:?}", run_dir);
        std::fs::remove_dir_all(&run_dir)?;
    }
    std::fs::create_dir_all(&run_dir)?;

    Ok(run_dir)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging();

    let config = AppConfig::load(&cli.config_path).unwrap_or_else(|e| {
        panic!(
            "Failed to load configuration file from '{}': {}",
            &cli.config_path, e
        )
    });

    let run_dir = create_run_folder(&config).unwrap_or_else(|e| {
        panic!("Failed to create run folder: {e}");
    });

    config
        .save_to_file(run_dir.join("saved_config.yaml"))
        .unwrap_or_else(|e| {
            panic!("Failed to save configuration file: {e}");
        });

    let spawner = Arc::new(LinearSpawner::new(NimGame::schema()));

    if let Err(e) = orchestrator::run_training::<NimGame>(config, run_dir, spawner).await {
        tracing::error!("Training run failed: {e:#}");
        std::process::exit(1);
    }
}
