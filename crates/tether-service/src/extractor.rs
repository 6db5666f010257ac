use crate::state::SharedState;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::bridge::{parse_device_list, Bridge, DeviceState};
use tether_core::config::LastExtraction;
use tether_core::ipc::RunSummary;
use tether_core::pipeline::{ExtractionPipeline, ExtractionRequest, ExtractionResult, Outcome};
use tether_core::probe::ConnectivityProbe;
use tether_core::runner::CommandRunner;
use tokio::sync::Mutex as AsyncMutex;

/// Runs the pipeline with at most one run in flight per process and folds
/// each result into shared state.
pub struct Extractor {
    runner: Arc<dyn CommandRunner>,
    bridge: Bridge,
    state: Arc<SharedState>,
    local_dir: PathBuf,
    gate: AsyncMutex<()>,
}

impl Extractor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bridge: Bridge,
        state: Arc<SharedState>,
        local_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            bridge,
            state,
            local_dir,
            gate: AsyncMutex::new(()),
        }
    }

    pub fn probe(&self) -> ConnectivityProbe<'_> {
        ConnectivityProbe::new(self.runner.as_ref(), &self.bridge)
    }

    pub async fn run_once(&self) -> ExtractionResult {
        let _running = self.gate.lock().await;
        let request = self.state.read(|s| ExtractionRequest {
            source: s.config.source.clone(),
            local_dir: self.local_dir.clone(),
            preferred_device: s.config.preferred_device.clone(),
        });
        let result = ExtractionPipeline::new(self.runner.as_ref(), &self.bridge)
            .run(&request)
            .await;
        self.record(&result);
        result
    }

    /// Whether the bridge currently lists any device as online.
    pub async fn any_device_online(&self) -> bool {
        match self.runner.run(&self.bridge.devices()).await {
            Some(listing) => parse_device_list(&listing)
                .iter()
                .any(|entry| entry.state == DeviceState::Online),
            None => false,
        }
    }

    fn record(&self, result: &ExtractionResult) {
        let summary = RunSummary::from(result);
        if result.is_success() {
            self.state.update(|s| {
                s.last_run = Some(summary);
                s.config.last_extraction = Some(LastExtraction {
                    finished_at: result.finished_at,
                    device: result.device.clone(),
                    source_path: result.selected_path.clone(),
                    tier: result.tier_used,
                    row_counts: result.row_counts.clone(),
                });
            });
        } else {
            self.state.update_transient(|s| s.last_run = Some(summary));
        }
        self.state.activity().record(match result.outcome {
            Outcome::Success => format!("run succeeded: {}", result.message),
            outcome => format!("run ended {}: {}", outcome_label(outcome), result.message),
        });
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::NotFound => "not-found",
        Outcome::NoDevice => "no-device",
        Outcome::TransportError => "transport-error",
        Outcome::ToolUnavailable => "tool-unavailable",
    }
}
