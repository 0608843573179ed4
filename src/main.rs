//! menu-sync: offline sync engine for restaurant menu and table data
//!
//! Runs the background sync loop (`run`) or a single operator command
//! against the local store.

mod cli;

use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{error, info, warn};

use menu_sync::{Config, SyncRuntime};

#[derive(Parser)]
#[command(name = "menu-sync")]
#[command(about = "Offline-first sync engine for restaurant menu and table data")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "menu-sync.toml")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "MENU_SYNC_DATA_DIR")]
    data_dir: Option<String>,

    /// Server base URL (overrides config file)
    #[arg(long, env = "MENU_SYNC_SERVER_URL")]
    server_url: Option<String>,

    /// Bearer token for the server API
    #[arg(long, env = "MENU_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: cli::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("menu_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(Path::new(&cli.config))?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.store.data_dir = PathBuf::from(data_dir);
    }
    if let Some(url) = cli.server_url {
        config.server.base_url = url;
    }
    if let Some(token) = cli.token {
        config.server.auth_token = Some(token);
    }
    config.validate()?;

    info!("Data dir: {}", config.store.data_dir.display());
    info!("Server: {}", config.server.base_url);

    let runtime = SyncRuntime::open(config)?;

    if matches!(cli.command, cli::Commands::Run) {
        return run(runtime).await;
    }

    match cli::execute_command(&runtime, cli.command).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(runtime: SyncRuntime) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = runtime.coordinator();
    let handle = tokio::spawn(coordinator.run(shutdown_rx));

    // Log events as they happen
    let mut events = runtime.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "menu_sync::events", "{}", json),
                    Err(e) => error!(error = %e, "Failed to encode event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}
