use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_core::ipc::{send_request, ControlRequest, ControlResponse};
use tether_core::paths::{control_socket_path, data_dir};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Control a running tether service", long_about = None)]
struct Cli {
    /// Service data directory (locates the control socket)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scheduler state, devices with live connectivity, last run
    Status,

    /// Run one extraction now and wait for the result
    RunOnce,

    /// Enable the auto-update scheduler
    Enable,

    /// Disable the auto-update scheduler
    Disable,

    /// Set the polling interval in minutes (clamped to 1..=1440)
    Interval { minutes: u64 },

    /// Register a device address (USB serial or host:port)
    Add {
        address: String,
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove a registered device
    Remove { address: String },

    /// Rename a registered device
    Rename { address: String, name: String },

    /// Prefer this device when several are online
    Prefer { address: String },

    /// Run the connectivity probe for one address
    Probe { address: String },

    /// Recent activity
    Events {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    let socket = control_socket_path(&data);

    let request = match cli.command {
        Commands::Status => ControlRequest::GetStatus,
        Commands::RunOnce => ControlRequest::RunOnce,
        Commands::Enable => ControlRequest::SetEnabled { enabled: true },
        Commands::Disable => ControlRequest::SetEnabled { enabled: false },
        Commands::Interval { minutes } => ControlRequest::SetInterval { minutes },
        Commands::Add { address, name } => ControlRequest::RegisterDevice {
            address,
            display_name: name,
        },
        Commands::Remove { address } => ControlRequest::UnregisterDevice { address },
        Commands::Rename { address, name } => ControlRequest::RenameDevice {
            address,
            display_name: name,
        },
        Commands::Prefer { address } => ControlRequest::SetPreferredDevice { address },
        Commands::Probe { address } => ControlRequest::ProbeDevice { address },
        Commands::Events { limit } => ControlRequest::GetEvents { limit: Some(limit) },
    };

    match send_request(&socket, &request).await? {
        ControlResponse::Probe { report } => {
            print!("{}", report.raw_transcript);
            Ok(())
        }
        ControlResponse::Rejected { reason } => Err(anyhow!("rejected: {reason}")),
        ControlResponse::Error { message } => Err(anyhow!(message)),
        response => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    }
}
