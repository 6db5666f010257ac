use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::bridge::Bridge;
use tether_core::config::ConfigStore;
use tether_core::paths::{config_path, control_socket_path, data_dir, local_store_dir};
use tether_core::runner::SystemRunner;
use tether_service::server::spawn_control_server;
use tether_service::{Manager, SharedState};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tether device extraction service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler and the control socket until interrupted
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the pipeline once and print the result as JSON
    Extract {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Probe one device address and print the transcript
    Probe {
        address: String,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { data_dir } => run_command(data_dir).await,
        Commands::Extract { data_dir } => extract_command(data_dir).await,
        Commands::Probe { address, data_dir } => probe_command(data_dir, &address).await,
    }
}

fn build_manager(data_dir_override: Option<PathBuf>) -> Result<(PathBuf, Arc<Manager>)> {
    let data = match data_dir_override {
        Some(dir) => dir,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&data)?;
    let state = Arc::new(SharedState::load(ConfigStore::new(config_path(&data)))?);
    let manager = Manager::new(
        state,
        Arc::new(SystemRunner::new()),
        Bridge::from_env(),
        local_store_dir(&data),
    );
    Ok((data, Arc::new(manager)))
}

async fn run_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let (data, manager) = build_manager(data_dir_override)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = spawn_control_server(control_socket_path(&data), manager.clone(), shutdown_rx)?;

    if manager.resume().await {
        info!("auto-update resumed");
    }
    info!(data_dir = %data.display(), "service started");

    signal::ctrl_c().await?;
    info!("service stopping");
    let _ = shutdown_tx.send(true);
    manager.shutdown().await;
    let _ = server_task.await;
    Ok(())
}

async fn extract_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let (_, manager) = build_manager(data_dir_override)?;
    let result = manager.run_once().await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn probe_command(data_dir_override: Option<PathBuf>, address: &str) -> Result<()> {
    let (_, manager) = build_manager(data_dir_override)?;
    let report = manager.probe_device(address).await;
    print!("{}", report.raw_transcript);
    Ok(())
}
