//! Two-stage reachability check for a registered device address.

use crate::bridge::{matches_address, parse_device_list, Bridge, DeviceState};
use crate::runner::{CommandRunner, CommandSpec, RawOutput};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
const PING_WAIT_SECS: &str = "3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub address: String,
    pub connected: bool,
    pub unauthorized: bool,
    pub raw_transcript: String,
}

pub struct ConnectivityProbe<'a> {
    runner: &'a dyn CommandRunner,
    bridge: &'a Bridge,
}

impl<'a> ConnectivityProbe<'a> {
    pub fn new(runner: &'a dyn CommandRunner, bridge: &'a Bridge) -> Self {
        Self { runner, bridge }
    }

    pub async fn probe(&self, address: &str) -> ProbeReport {
        let mut transcript = String::new();

        if let Some(host) = network_host(address) {
            let ping = CommandSpec::new("ping", PING_TIMEOUT).args(["-c", "1", "-W", PING_WAIT_SECS, host]);
            if !self.record(&ping, &mut transcript).await {
                let _ = writeln!(transcript, "Result: {host} is not reachable");
                debug!(address, "ping failed; skipping bridge connect");
                return ProbeReport {
                    address: address.to_string(),
                    connected: false,
                    unauthorized: false,
                    raw_transcript: transcript,
                };
            }
            self.record(&self.bridge.connect(address), &mut transcript).await;
        }

        let devices = self.bridge.devices();
        let listing = self.capture(&devices, &mut transcript).await;
        let state = listing.as_deref().and_then(|out| {
            parse_device_list(out)
                .into_iter()
                .find(|entry| matches_address(&entry.serial, address))
                .map(|entry| entry.state)
        });

        let (connected, unauthorized) = match state {
            Some(DeviceState::Online) => (true, false),
            Some(DeviceState::Unauthorized) => (false, true),
            _ => (false, false),
        };
        let verdict = match (connected, unauthorized) {
            (true, _) => "connected",
            (_, true) => "unauthorized (accept the debugging prompt on the device)",
            _ => "not connected",
        };
        let _ = writeln!(transcript, "Result: {verdict}");
        debug!(address, connected, unauthorized, "probe finished");

        ProbeReport {
            address: address.to_string(),
            connected,
            unauthorized,
            raw_transcript: transcript,
        }
    }

    /// `adb connect` each network address in turn until one attaches.
    pub async fn reconnect_any(&self, addresses: &[String]) -> Option<String> {
        for address in addresses.iter().filter(|a| network_host(a).is_some()) {
            let spec = self.bridge.connect(address);
            let output = match self.runner.execute(&spec).await {
                Ok(output) => output,
                Err(err) => {
                    debug!(address = %address, error = %err, "reconnect attempt failed");
                    continue;
                }
            };
            if connect_succeeded(&output) {
                info!(address = %address, "reconnected to device");
                return Some(address.clone());
            }
        }
        None
    }

    /// Run `spec`, append it to the transcript, report zero exit.
    async fn record(&self, spec: &CommandSpec, transcript: &mut String) -> bool {
        self.capture(spec, transcript).await.is_some()
    }

    async fn capture(&self, spec: &CommandSpec, transcript: &mut String) -> Option<String> {
        let _ = writeln!(transcript, "$ {spec}");
        match self.runner.execute(spec).await {
            Ok(output) => {
                let code = output
                    .status
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let _ = writeln!(transcript, "Return code: {code}");
                if !output.stdout.trim().is_empty() {
                    let _ = writeln!(transcript, "Output: {}", output.stdout.trim());
                }
                if !output.stderr.trim().is_empty() {
                    let _ = writeln!(transcript, "Error: {}", output.stderr.trim());
                }
                output.success().then(|| output.stdout)
            }
            Err(err) => {
                let _ = writeln!(transcript, "Error: {err}");
                None
            }
        }
    }
}

fn connect_succeeded(output: &RawOutput) -> bool {
    let text = output.combined().to_lowercase();
    text.contains("connected")
        && !["failed", "unable", "cannot"]
            .iter()
            .any(|marker| text.contains(marker))
}

/// Host part of a network address, `None` for USB serials.
pub fn network_host(address: &str) -> Option<&str> {
    if address.parse::<IpAddr>().is_ok() {
        return Some(address);
    }
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(host)
}
