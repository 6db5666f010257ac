//! One extraction run: pick a device, locate the source file, stage it to
//! shared storage, pull it, and clean up behind it.
//!
//! A run never returns an error. Every failure is folded into an
//! [`ExtractionResult`] whose outcome tells the caller whether retrying can
//! help. The diagnostic trace is attached only when the run did not succeed.

use crate::bridge::{matches_address, parse_device_list, Bridge, DeviceState, RemoteCommand};
use crate::config::SourceSettings;
use crate::escalation::{AccessTier, EscalationError, PrivilegeEscalator, NO_SUCH_FILE_MARKER};
use crate::runner::CommandRunner;
use crate::stats::{count_rows, LocalFile};
use crate::trace::Trace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    NotFound,
    NoDevice,
    TransportError,
    ToolUnavailable,
}

impl Outcome {
    /// Whether running again without outside intervention can succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Outcome::ToolUnavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("bridge tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error("no device reachable")]
    NoDeviceReachable,
    #[error("source file not found (tried {})", .tried.join(", "))]
    PathNotFound { tried: Vec<String> },
    #[error("transfer failed: {0}")]
    Transport(String),
}

impl PipelineError {
    pub fn outcome(&self) -> Outcome {
        match self {
            PipelineError::ToolUnavailable(_) => Outcome::ToolUnavailable,
            PipelineError::NoDeviceReachable => Outcome::NoDevice,
            PipelineError::PathNotFound { .. } => Outcome::NotFound,
            PipelineError::Transport(_) => Outcome::TransportError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub outcome: Outcome,
    pub message: String,
    pub device: Option<String>,
    pub selected_path: Option<String>,
    pub tier_used: Option<AccessTier>,
    pub staged: bool,
    pub local_file: Option<LocalFile>,
    #[serde(default)]
    pub row_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostic_trace: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Inputs for one run.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub source: SourceSettings,
    pub local_dir: PathBuf,
    pub preferred_device: Option<String>,
}

impl ExtractionRequest {
    pub fn local_path(&self) -> PathBuf {
        self.local_dir.join(&self.source.local_file_name)
    }
}

/// What a run learned so far; survives into the result on failure too.
#[derive(Debug, Default)]
struct Progress {
    device: Option<String>,
    selected_path: Option<String>,
    tier: Option<AccessTier>,
    staged: bool,
    local_file: Option<LocalFile>,
    row_counts: BTreeMap<String, u64>,
    warnings: Vec<String>,
}

impl Progress {
    fn warn(&mut self, message: String) {
        warn!(device = ?self.device, "{message}");
        self.warnings.push(message);
    }
}

pub struct ExtractionPipeline<'a> {
    runner: &'a dyn CommandRunner,
    bridge: &'a Bridge,
}

impl<'a> ExtractionPipeline<'a> {
    pub fn new(runner: &'a dyn CommandRunner, bridge: &'a Bridge) -> Self {
        Self { runner, bridge }
    }

    pub async fn run(&self, request: &ExtractionRequest) -> ExtractionResult {
        let mut trace = Trace::new();
        self.run_traced(request, &mut trace).await
    }

    /// Like [`run`](Self::run) but leaves the full trace with the caller,
    /// including on success.
    pub async fn run_traced(&self, request: &ExtractionRequest, trace: &mut Trace) -> ExtractionResult {
        let mut progress = Progress::default();
        let outcome = self.execute(request, &mut progress, trace).await;
        let finished_at = Utc::now();

        match outcome {
            Ok(()) => {
                let message = format!(
                    "extracted {} from {} as {}{}",
                    progress.selected_path.as_deref().unwrap_or("?"),
                    progress.device.as_deref().unwrap_or("?"),
                    progress.tier.map(AccessTier::label).unwrap_or("?"),
                    if progress.staged { " via staging" } else { " by direct pull" },
                );
                info!(rows = ?progress.row_counts, "{message}");
                build_result(Outcome::Success, message, progress, Vec::new(), finished_at)
            }
            Err(err) => {
                warn!(error = %err, "extraction failed");
                let lines = trace.clone().into_lines();
                build_result(err.outcome(), err.to_string(), progress, lines, finished_at)
            }
        }
    }

    async fn execute(
        &self,
        request: &ExtractionRequest,
        progress: &mut Progress,
        trace: &mut Trace,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let checked = self.check_tool(trace).await;
        trace.step("tool check", started.elapsed(), checked.is_ok());
        checked?;

        let started = Instant::now();
        let selected = self.select_device(request.preferred_device.as_deref(), trace).await;
        trace.step("device selection", started.elapsed(), selected.is_ok());
        let device = selected?;
        progress.device = Some(device.clone());

        let escalator = PrivilegeEscalator::new(self.runner, self.bridge, &device);
        let staging = request.source.staging_path.as_str();

        let started = Instant::now();
        let cleared = escalator
            .escalate(&RemoteCommand::remove(staging), None, trace)
            .await;
        trace.step("stale staging cleanup", started.elapsed(), cleared.is_ok());
        if let Err(err) = cleared {
            progress.warn(format!("could not clear stale staged copy {staging}: {err}"));
        }

        let started = Instant::now();
        let resolved = self.resolve(&escalator, &request.source.candidate_paths, trace).await;
        trace.step("path resolution", started.elapsed(), resolved.is_ok());
        let (source_path, tier) = match resolved {
            Ok(found) => found,
            Err(err) => {
                escalator.collect_diagnostics(trace).await;
                return Err(err);
            }
        };
        progress.selected_path = Some(source_path.clone());
        progress.tier = Some(tier);

        let started = Instant::now();
        let staged = self.stage(&escalator, &source_path, staging, progress, trace).await;
        trace.step("staging", started.elapsed(), staged);
        progress.staged = staged;

        let remote = if staged { staging } else { source_path.as_str() };
        let local_path = request.local_path();
        let started = Instant::now();
        let pulled = self.pull(&device, remote, &local_path, trace).await;
        trace.step("pull", started.elapsed(), pulled.is_ok());

        // The copy command may have left a file behind even if verification
        // failed, so always try.
        let started = Instant::now();
        let removed = escalator
            .escalate(&RemoteCommand::remove(staging), progress.tier, trace)
            .await;
        trace.step("staging cleanup", started.elapsed(), removed.is_ok());
        if let Err(err) = removed {
            progress.warn(format!("could not remove staged copy {staging}: {err}"));
        }

        pulled?;
        self.record_local_details(&local_path, &request.source.count_tables, progress)
            .await;
        Ok(())
    }

    async fn check_tool(&self, trace: &mut Trace) -> Result<(), PipelineError> {
        let spec = self.bridge.version();
        match self.runner.execute(&spec).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                let first = output.stdout.lines().next().unwrap_or_default().to_string();
                trace.push(format!("$ {spec} => {first}"));
                Ok(())
            }
            Ok(output) => {
                trace.push(format!("$ {spec} => exit {:?}", output.status));
                Err(PipelineError::ToolUnavailable(format!(
                    "`{spec}` exited with {:?}: {}",
                    output.status,
                    output.combined()
                )))
            }
            Err(err) => {
                trace.push(format!("$ {spec} => {err}"));
                Err(PipelineError::ToolUnavailable(err.to_string()))
            }
        }
    }

    async fn select_device(
        &self,
        preferred: Option<&str>,
        trace: &mut Trace,
    ) -> Result<String, PipelineError> {
        let spec = self.bridge.devices();
        let listing = self
            .runner
            .run(&spec)
            .await
            .ok_or_else(|| PipelineError::Transport(format!("`{spec}` produced no output")))?;
        let online: Vec<String> = parse_device_list(&listing)
            .into_iter()
            .filter(|entry| entry.state == DeviceState::Online)
            .map(|entry| entry.serial)
            .collect();
        trace.push(format!("$ {spec} => online: [{}]", online.join(", ")));

        if let Some(address) = preferred {
            if let Some(serial) = online.iter().find(|s| matches_address(s, address)) {
                return Ok(serial.clone());
            }
            debug!(preferred = address, "preferred device not online");
        }
        online
            .into_iter()
            .next()
            .ok_or(PipelineError::NoDeviceReachable)
    }

    /// First candidate confirmed present, with the tier that could see it.
    async fn resolve(
        &self,
        escalator: &PrivilegeEscalator<'_>,
        candidates: &[String],
        trace: &mut Trace,
    ) -> Result<(String, AccessTier), PipelineError> {
        let mut preferred = None;
        for path in candidates {
            match escalator
                .escalate(&RemoteCommand::list(path), preferred, trace)
                .await
            {
                Ok(found) if !found.output.contains(NO_SUCH_FILE_MARKER) => {
                    trace.push(format!("found {path} as {}", found.tier));
                    return Ok((path.clone(), found.tier));
                }
                Ok(found) => {
                    trace.push(format!("{path}: absent"));
                    preferred = Some(found.tier);
                }
                Err(EscalationError::Missing { .. }) => trace.push(format!("{path}: absent")),
                Err(err) => trace.push(format!("{path}: {err}")),
            }
        }
        Err(PipelineError::PathNotFound {
            tried: candidates.to_vec(),
        })
    }

    /// Copy the source to shared storage and confirm the copy exists.
    async fn stage(
        &self,
        escalator: &PrivilegeEscalator<'_>,
        source: &str,
        staging: &str,
        progress: &mut Progress,
        trace: &mut Trace,
    ) -> bool {
        let copied = escalator
            .escalate(&RemoteCommand::copy(source, staging), progress.tier, trace)
            .await;
        let copy_tier = match copied {
            Ok(done) => done.tier,
            Err(err) => {
                progress.warn(format!("staging failed ({err}); pulling {source} directly"));
                return false;
            }
        };
        match escalator
            .escalate(&RemoteCommand::list(staging), Some(copy_tier), trace)
            .await
        {
            Ok(listing) if !listing.output.contains(NO_SUCH_FILE_MARKER) => true,
            Ok(_) | Err(_) => {
                progress.warn(format!(
                    "staged copy {staging} could not be verified; pulling {source} directly"
                ));
                false
            }
        }
    }

    /// Pull into `LOCAL.partial` and rename over the local file.
    async fn pull(
        &self,
        device: &str,
        remote: &str,
        local: &Path,
        trace: &mut Trace,
    ) -> Result<(), PipelineError> {
        if let Some(dir) = local.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                PipelineError::Transport(format!("create {}: {e}", dir.display()))
            })?;
        }
        let mut partial = local.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let spec = self.bridge.pull(device, remote, &partial);
        let result = self.runner.execute(&spec).await;
        let failure = match result {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!("exit {:?}: {}", output.status, output.combined())),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failure {
            trace.push(format!("$ {spec} => {reason}"));
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(PipelineError::Transport(format!("pull of {remote} failed: {reason}")));
        }
        trace.push(format!("$ {spec} => ok"));

        tokio::fs::rename(&partial, local).await.map_err(|e| {
            PipelineError::Transport(format!(
                "rename {} -> {}: {e}",
                partial.display(),
                local.display()
            ))
        })
    }

    async fn record_local_details(&self, local: &Path, tables: &[String], progress: &mut Progress) {
        match LocalFile::inspect(local) {
            Ok(file) => progress.local_file = Some(file),
            Err(err) => progress.warn(format!("could not stat {}: {err}", local.display())),
        }
        if tables.is_empty() {
            return;
        }
        let path = local.to_path_buf();
        let tables = tables.to_vec();
        match tokio::task::spawn_blocking(move || count_rows(&path, &tables)).await {
            Ok(Ok(counts)) => progress.row_counts = counts,
            Ok(Err(err)) => progress.warn(format!("row count failed: {err}")),
            Err(err) => progress.warn(format!("row count task failed: {err}")),
        }
    }
}

fn build_result(
    outcome: Outcome,
    message: String,
    progress: Progress,
    diagnostic_trace: Vec<String>,
    finished_at: DateTime<Utc>,
) -> ExtractionResult {
    ExtractionResult {
        outcome,
        message,
        device: progress.device,
        selected_path: progress.selected_path,
        tier_used: progress.tier,
        staged: progress.staged,
        local_file: progress.local_file,
        row_counts: progress.row_counts,
        warnings: progress.warnings,
        diagnostic_trace,
        finished_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBridge;
    use rusqlite::Connection;
    use tempfile::{tempdir, TempDir};

    const P1: &str = "/data/data/com.bca.bcatrack/cache/cache/data/sql.db";
    const P2: &str = "/data/user/0/com.bca.bcatrack/cache/cache/data/sql.db";
    const STAGE: &str = "/sdcard/sql.db";

    fn request(dir: &TempDir) -> ExtractionRequest {
        ExtractionRequest {
            source: SourceSettings::default(),
            local_dir: dir.path().join("db"),
            preferred_device: None,
        }
    }

    fn sqlite_bytes() -> Vec<u8> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seed.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE DWJJOB (id INTEGER); CREATE TABLE DWVVEH (id INTEGER);
             INSERT INTO DWJJOB VALUES (1), (2); INSERT INTO DWVVEH VALUES (1);",
        )
        .unwrap();
        drop(conn);
        std::fs::read(&path).unwrap()
    }

    fn device() -> FakeBridge {
        FakeBridge::new().with_device("10.0.0.5:5555", DeviceState::Online)
    }

    #[tokio::test]
    async fn second_candidate_is_selected_and_first_never_staged() {
        let fake = device().with_file(P2, &sqlite_bytes(), AccessTier::Unprivileged);
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let result = ExtractionPipeline::new(&fake, &bridge).run(&request(&dir)).await;

        assert_eq!(result.outcome, Outcome::Success, "{result:?}");
        assert_eq!(result.selected_path.as_deref(), Some(P2));
        assert!(result.staged);
        assert!(!fake.calls().iter().any(|c| c.contains(&format!("cp {P1}"))));
        assert_eq!(result.row_counts["DWJJOB"], 2);
        assert_eq!(result.row_counts["DWVVEH"], 1);
        assert!(result.diagnostic_trace.is_empty());
        assert!(dir.path().join("db").join("sql.db").exists());
        assert!(!dir.path().join("db").join("sql.db.partial").exists());
    }

    #[tokio::test]
    async fn denied_path_escalates_once_and_staged_copy_is_removed() {
        let fake = device().with_file(P2, &sqlite_bytes(), AccessTier::SuperuserUid);
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let mut trace = Trace::new();
        let result = ExtractionPipeline::new(&fake, &bridge)
            .run_traced(&request(&dir), &mut trace)
            .await;

        assert_eq!(result.outcome, Outcome::Success, "{result:?}");
        assert_eq!(result.tier_used, Some(AccessTier::SuperuserUid));
        assert_eq!(trace.lines().filter(|l| l.starts_with("escalate:")).count(), 1);
        assert!(!fake.remote_file_exists(STAGE));
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[tokio::test]
    async fn staging_failure_falls_back_to_direct_pull() {
        let fake = device()
            .with_file(P1, &sqlite_bytes(), AccessTier::Unprivileged)
            .failing_stage();
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let result = ExtractionPipeline::new(&fake, &bridge).run(&request(&dir)).await;

        assert_eq!(result.outcome, Outcome::Success, "{result:?}");
        assert!(!result.staged);
        assert!(fake
            .calls()
            .iter()
            .any(|c| c.starts_with(&format!("adb -s 10.0.0.5:5555 pull {P1} "))));
        assert!(result.warnings.iter().any(|w| w.contains("staging failed")));
    }

    #[tokio::test]
    async fn no_candidate_is_not_found_with_diagnostics() {
        let fake = device();
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let result = ExtractionPipeline::new(&fake, &bridge).run(&request(&dir)).await;

        assert_eq!(result.outcome, Outcome::NotFound);
        assert!(result.outcome.is_retryable());
        assert!(result.diagnostic_trace.iter().any(|l| l.starts_with("diag [su-0] whoami")));
        assert_eq!(fake.count_calls("adb -s 10.0.0.5:5555 pull"), 0);
    }

    #[tokio::test]
    async fn shell_wrapper_tier_wins_when_uid_switch_is_unsupported() {
        let fake = device()
            .with_file(P1, &sqlite_bytes(), AccessTier::SuperuserUid)
            .without_su_uid();
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let mut trace = Trace::new();
        let result = ExtractionPipeline::new(&fake, &bridge)
            .run_traced(&request(&dir), &mut trace)
            .await;

        assert_eq!(result.outcome, Outcome::Success, "{result:?}");
        assert_eq!(result.tier_used, Some(AccessTier::SuperuserShell));
        assert_eq!(trace.lines().filter(|l| l.starts_with("escalate:")).count(), 2);
        assert!(fake
            .calls()
            .iter()
            .any(|c| c.ends_with(&format!("shell su -c 'cp {P1} {STAGE}'"))));
        assert!(result.staged);
        assert!(!fake.remote_file_exists(STAGE));
        assert_eq!(result.row_counts["DWJJOB"], 2);
    }

    #[tokio::test]
    async fn root_only_file_without_any_superuser_is_not_found() {
        let fake = device()
            .with_file(P1, &sqlite_bytes(), AccessTier::SuperuserUid)
            .without_su_uid()
            .without_su_shell();
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let result = ExtractionPipeline::new(&fake, &bridge).run(&request(&dir)).await;

        assert_eq!(result.outcome, Outcome::NotFound);
        assert!(result
            .diagnostic_trace
            .iter()
            .any(|l| l.starts_with(&format!("{P1}: all access tiers failed"))));
        assert_eq!(fake.count_calls("adb -s 10.0.0.5:5555 pull"), 0);
    }

    #[tokio::test]
    async fn missing_tool_and_missing_device_are_distinguished() {
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();

        let result = ExtractionPipeline::new(&FakeBridge::new().without_tool(), &bridge)
            .run(&request(&dir))
            .await;
        assert_eq!(result.outcome, Outcome::ToolUnavailable);
        assert!(!result.outcome.is_retryable());

        let unauthorized = FakeBridge::new().with_device("10.0.0.5:5555", DeviceState::Unauthorized);
        let result = ExtractionPipeline::new(&unauthorized, &bridge)
            .run(&request(&dir))
            .await;
        assert_eq!(result.outcome, Outcome::NoDevice);
        assert!(!result.diagnostic_trace.is_empty());
    }

    #[tokio::test]
    async fn preferred_device_wins_when_online() {
        let fake = device()
            .with_device("R58M123ABC", DeviceState::Online)
            .with_file(P1, &sqlite_bytes(), AccessTier::Unprivileged);
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let mut req = request(&dir);
        req.preferred_device = Some("R58M123ABC".to_string());
        let result = ExtractionPipeline::new(&fake, &bridge).run(&req).await;
        assert_eq!(result.device.as_deref(), Some("R58M123ABC"));

        req.preferred_device = Some("10.0.0.99:5555".to_string());
        let result = ExtractionPipeline::new(&fake, &bridge).run(&req).await;
        assert_eq!(result.device.as_deref(), Some("10.0.0.5:5555"));
    }

    #[tokio::test]
    async fn failed_pull_is_transport_error_and_cleanup_still_runs() {
        let fake = device()
            .with_file(P1, &sqlite_bytes(), AccessTier::Unprivileged)
            .failing_pull();
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let result = ExtractionPipeline::new(&fake, &bridge).run(&request(&dir)).await;
        assert_eq!(result.outcome, Outcome::TransportError);
        assert!(!fake.remote_file_exists(STAGE));
        assert!(!dir.path().join("db").join("sql.db").exists());
    }

    #[tokio::test]
    async fn cleanup_failure_is_only_a_warning() {
        let fake = device()
            .with_file(P1, &sqlite_bytes(), AccessTier::Unprivileged)
            .failing_cleanup();
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let result = ExtractionPipeline::new(&fake, &bridge).run(&request(&dir)).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.starts_with("could not remove staged copy")));
    }

    #[tokio::test]
    async fn unreadable_database_keeps_success_with_warning() {
        let fake = device().with_file(P1, b"not a database", AccessTier::Unprivileged);
        let bridge = Bridge::new("adb");
        let dir = tempdir().unwrap();
        let result = ExtractionPipeline::new(&fake, &bridge).run(&request(&dir)).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.row_counts.is_empty());
        assert!(result.warnings.iter().any(|w| w.starts_with("row count failed")));
        assert_eq!(result.local_file.unwrap().size, 14);
    }
}
