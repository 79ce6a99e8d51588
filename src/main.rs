use anyhow::{Context, Result};
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::Duration;

use firstchat::bot::console::{self, ConsoleCommand, HELP};
use firstchat::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("Starting First Chat Dock v{}", firstchat::VERSION);

    let config_dir = env::var("FIRSTCHAT_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config_manager = ConfigurationManager::new(&config_dir);
    if let Err(e) = config_manager.initialize().await {
        error!("Failed to initialize configuration system: {}", e);
        return Err(e);
    }
    let config = config_manager.get_config().await;

    let state = Arc::new(
        JsonStateStore::open(&config.state_file)
            .await
            .with_context(|| format!("opening state file {}", config.state_file.display()))?,
    );

    // Settings file and environment first, persisted values fill the gaps
    let settings = config.resolve_twitch_config(state.as_ref());

    let clock = Arc::new(SystemClock);
    let tracker = ChatterTracker::load(state.clone(), clock.clone(), config.bots(), DEFAULT_BOTS);
    let mut dock = ChatterDock::new(
        Box::new(TwitchConnection::new()),
        tracker,
        settings,
        state.clone(),
        clock,
    );

    let (command_tx, command_rx) = mpsc::channel(32);
    console::spawn_stdin_reader(command_tx.clone());

    let shutdown_tx = command_tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                let _ = shutdown_tx.send(ConsoleCommand::Quit).await;
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    match dock.settings().validate() {
        Ok(()) => {
            if let Err(e) = command_tx.send(ConsoleCommand::Connect).await {
                warn!("Could not queue initial connect: {}", e);
            }
        }
        Err(e) => println!("{}; edit {} and type 'connect'", e, config_manager.config_path().display()),
    }
    drop(command_tx);

    println!("{}", HELP);
    let interval = Duration::from_secs(config.reset_check_interval_seconds.max(1));
    dock.run(command_rx, config_manager.subscribe_to_changes(), interval)
        .await?;

    state.flush().await?;
    info!("State saved to {}", state.path().display());
    Ok(())
}
