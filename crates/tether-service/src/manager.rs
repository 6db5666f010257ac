//! Control-plane facade over shared state, the extractor and the scheduler.

use crate::extractor::Extractor;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::state::SharedState;
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::bridge::Bridge;
use tether_core::config::DeviceRecord;
use tether_core::ipc::{
    ActivityEntry, ControlHandler, ControlRequest, ControlResponse, DeviceStatus, StatusReport,
};
use tether_core::pipeline::ExtractionResult;
use tether_core::probe::ProbeReport;
use tether_core::runner::CommandRunner;

pub struct Manager {
    state: Arc<SharedState>,
    extractor: Arc<Extractor>,
    scheduler: Scheduler,
}

impl Manager {
    pub fn new(
        state: Arc<SharedState>,
        runner: Arc<dyn CommandRunner>,
        bridge: Bridge,
        local_dir: PathBuf,
    ) -> Self {
        let extractor = Arc::new(Extractor::new(runner, bridge, state.clone(), local_dir));
        let scheduler = Scheduler::new(state.clone(), extractor.clone());
        Self {
            state,
            extractor,
            scheduler,
        }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// One pipeline run; waits for any run already in flight.
    pub async fn run_once(&self) -> ExtractionResult {
        self.state.activity().record("manual run requested");
        self.extractor.run_once().await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), SchedulerError> {
        if enabled {
            self.scheduler.start().await.map(|_| ())
        } else {
            self.scheduler.stop().await;
            Ok(())
        }
    }

    /// Clamp to [1, 1440] minutes and persist. Takes effect from the next wait.
    pub fn set_interval(&self, minutes: u64) -> u32 {
        let kept = self.state.update(|s| s.config.set_interval(minutes));
        self.state
            .activity()
            .record(format!("interval set to {kept} min"));
        kept
    }

    /// Returns the stored record and whether it was newly added.
    pub fn register_device(&self, address: &str, display_name: Option<&str>) -> Result<(DeviceRecord, bool)> {
        let address = address.trim();
        if address.is_empty() {
            bail!("device address must not be empty");
        }
        let (added, record) = self.state.update(|s| {
            let added = s.config.register_device(address, display_name);
            (added, s.config.device(address).cloned())
        });
        let record = record.ok_or_else(|| anyhow!("device {address} vanished after registration"))?;
        if added {
            self.state
                .activity()
                .record(format!("registered {} ({})", record.address, record.display_name));
        }
        Ok((record, added))
    }

    pub fn unregister_device(&self, address: &str) -> bool {
        let removed = self.state.update(|s| s.config.unregister_device(address));
        if removed {
            self.state
                .activity()
                .record(format!("unregistered {address}"));
        }
        removed
    }

    pub fn rename_device(&self, address: &str, display_name: &str) -> Result<()> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            bail!("display name must not be empty");
        }
        if !self.state.update(|s| s.config.rename_device(address, display_name)) {
            bail!("device {address} is not registered");
        }
        self.state
            .activity()
            .record(format!("renamed {address} to {display_name}"));
        Ok(())
    }

    pub fn set_preferred_device(&self, address: &str) -> Result<String> {
        let name = self
            .state
            .update(|s| s.config.set_preferred_device(address))
            .ok_or_else(|| anyhow!("device {address} is not registered"))?;
        self.state
            .activity()
            .record(format!("preferred device set to {name} ({address})"));
        Ok(name)
    }

    pub async fn probe_device(&self, address: &str) -> ProbeReport {
        self.extractor.probe().probe(address).await
    }

    /// Live status. Probes every registered device; with none connected an
    /// enabled scheduler is switched off.
    pub async fn status(&self) -> StatusReport {
        let config = self.state.config();
        let probe = self.extractor.probe();
        let mut devices = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            let report = probe.probe(&device.address).await;
            devices.push(DeviceStatus {
                address: device.address.clone(),
                display_name: device.display_name.clone(),
                connected: report.connected,
                unauthorized: report.unauthorized,
                preferred: config.preferred_device.as_deref() == Some(device.address.as_str()),
            });
        }

        if config.scheduler.enabled && !devices.iter().any(|d| d.connected) {
            self.scheduler.force_disable().await;
        }

        let now = Utc::now();
        let started_at = self.state.started_at();
        self.state.read(|s| StatusReport {
            enabled: s.config.scheduler.enabled,
            interval_minutes: s.config.scheduler.interval_minutes,
            running: s.running,
            next_run_at: s.next_run_at,
            last_extraction: s.config.last_extraction.clone(),
            last_run: s.last_run.clone(),
            devices,
            preferred_device: s.config.preferred_device.clone(),
            started_at,
            uptime_secs: (now - started_at).num_seconds().max(0) as u64,
            server_time: now,
        })
    }

    pub fn events(&self, limit: Option<usize>) -> Vec<ActivityEntry> {
        self.state.activity().recent(limit)
    }

    pub async fn resume(&self) -> bool {
        self.scheduler.resume().await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

#[async_trait::async_trait]
impl ControlHandler for Manager {
    async fn handle(&self, request: ControlRequest) -> Result<ControlResponse> {
        let response = match request {
            ControlRequest::RunOnce => ControlResponse::Extraction {
                result: self.run_once().await,
            },
            ControlRequest::SetEnabled { enabled } => match self.set_enabled(enabled).await {
                Ok(()) => ControlResponse::Enabled { enabled },
                Err(err) => ControlResponse::Rejected {
                    reason: err.to_string(),
                },
            },
            ControlRequest::SetInterval { minutes } => ControlResponse::Interval {
                minutes: self.set_interval(minutes),
            },
            ControlRequest::RegisterDevice {
                address,
                display_name,
            } => {
                let (record, added) = self.register_device(&address, display_name.as_deref())?;
                ControlResponse::DeviceRegistered {
                    address: record.address,
                    display_name: record.display_name,
                    added,
                }
            }
            ControlRequest::UnregisterDevice { address } => {
                let removed = self.unregister_device(&address);
                ControlResponse::DeviceUnregistered { address, removed }
            }
            ControlRequest::RenameDevice {
                address,
                display_name,
            } => {
                self.rename_device(&address, &display_name)?;
                ControlResponse::DeviceRenamed {
                    address,
                    display_name,
                }
            }
            ControlRequest::SetPreferredDevice { address } => {
                let display_name = self.set_preferred_device(&address)?;
                ControlResponse::PreferredDevice {
                    address,
                    display_name,
                }
            }
            ControlRequest::ProbeDevice { address } => ControlResponse::Probe {
                report: self.probe_device(&address).await,
            },
            ControlRequest::GetStatus => ControlResponse::Status {
                status: self.status().await,
            },
            ControlRequest::GetEvents { limit } => ControlResponse::Events {
                events: self.events(limit),
            },
        };
        Ok(response)
    }
}
