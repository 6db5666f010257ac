//! Control-plane wire types and the newline-delimited JSON transport used
//! between `tether` and the service.

use crate::config::LastExtraction;
use crate::pipeline::{ExtractionResult, Outcome};
use crate::probe::ProbeReport;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", content = "data")]
pub enum ControlRequest {
    RunOnce,
    SetEnabled {
        enabled: bool,
    },
    SetInterval {
        minutes: u64,
    },
    RegisterDevice {
        address: String,
        display_name: Option<String>,
    },
    UnregisterDevice {
        address: String,
    },
    RenameDevice {
        address: String,
        display_name: String,
    },
    SetPreferredDevice {
        address: String,
    },
    ProbeDevice {
        address: String,
    },
    GetStatus,
    GetEvents {
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum ControlResponse {
    Extraction {
        result: ExtractionResult,
    },
    Enabled {
        enabled: bool,
    },
    Rejected {
        reason: String,
    },
    Interval {
        minutes: u32,
    },
    DeviceRegistered {
        address: String,
        display_name: String,
        added: bool,
    },
    DeviceUnregistered {
        address: String,
        removed: bool,
    },
    DeviceRenamed {
        address: String,
        display_name: String,
    },
    PreferredDevice {
        address: String,
        display_name: String,
    },
    Probe {
        report: ProbeReport,
    },
    Status {
        status: StatusReport,
    },
    Events {
        events: Vec<ActivityEntry>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub address: String,
    pub display_name: String,
    pub connected: bool,
    pub unauthorized: bool,
    pub preferred: bool,
}

/// Condensed view of the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub outcome: Outcome,
    pub message: String,
    pub device: Option<String>,
    pub finished_at: DateTime<Utc>,
    pub warnings: usize,
}

impl From<&ExtractionResult> for RunSummary {
    fn from(result: &ExtractionResult) -> Self {
        Self {
            outcome: result.outcome,
            message: result.message.clone(),
            device: result.device.clone(),
            finished_at: result.finished_at,
            warnings: result.warnings.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub running: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_extraction: Option<LastExtraction>,
    pub last_run: Option<RunSummary>,
    pub devices: Vec<DeviceStatus>,
    pub preferred_device: Option<String>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, request: ControlRequest) -> Result<ControlResponse>;
}

/// Serve requests on one connection until the peer hangs up.
pub async fn handle_connection<S>(stream: S, handler: Arc<dyn ControlHandler>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(line.trim_end()) {
            Ok(request) => {
                debug!(?request, "control request");
                handler
                    .handle(request)
                    .await
                    .unwrap_or_else(|e| ControlResponse::Error {
                        message: format!("{e:#}"),
                    })
            }
            Err(e) => ControlResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };
        write_line(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer
        .write_all(serde_json::to_string(value)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Send one request and wait for its response.
#[cfg(unix)]
pub async fn send_request(socket_path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow!("connect {}: {e}", socket_path.display()))?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    write_line(&mut writer, request).await?;

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("service closed the connection without a response"));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(not(unix))]
pub async fn send_request(socket_path: &Path, _request: &ControlRequest) -> Result<ControlResponse> {
    Err(anyhow!(
        "control socket {} is only supported on unix",
        socket_path.display()
    ))
}
