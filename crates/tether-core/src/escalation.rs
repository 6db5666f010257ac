//! Ordered privilege escalation against restricted device resources.
//!
//! A remote command is attempted under each [`AccessTier`] in turn and the
//! first tier that yields output without a permission-denied marker wins.
//! Callers remember the winning tier and pass it back as the preferred tier
//! for the next step of the same run.

use crate::bridge::{Bridge, RemoteCommand};
use crate::runner::{CommandRunner, RawOutput};
use crate::trace::Trace;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub const PERMISSION_DENIED_MARKER: &str = "Permission denied";
pub const NO_SUCH_FILE_MARKER: &str = "No such file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessTier {
    Unprivileged,
    SuperuserUid,
    SuperuserShell,
}

impl AccessTier {
    pub const ORDERED: [AccessTier; 3] = [
        AccessTier::Unprivileged,
        AccessTier::SuperuserUid,
        AccessTier::SuperuserShell,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AccessTier::Unprivileged => "plain",
            AccessTier::SuperuserUid => "su-0",
            AccessTier::SuperuserShell => "su-c",
        }
    }

    /// Attempt order with `preferred` moved to the front.
    pub fn order_from(preferred: Option<AccessTier>) -> Vec<AccessTier> {
        let mut order = Vec::with_capacity(Self::ORDERED.len());
        if let Some(first) = preferred {
            order.push(first);
        }
        order.extend(Self::ORDERED.iter().copied().filter(|t| Some(*t) != preferred));
        order
    }
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalated {
    pub output: String,
    pub tier: AccessTier,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscalationError {
    /// The device answered definitively that the target does not exist, so
    /// higher tiers would not change the answer.
    #[error("`{command}` reported no such file")]
    Missing { command: String },
    #[error("all access tiers failed for `{command}`")]
    Exhausted { command: String },
}

enum Attempt {
    Granted(String),
    Denied,
    Missing,
    Absent,
}

pub struct PrivilegeEscalator<'a> {
    runner: &'a dyn CommandRunner,
    bridge: &'a Bridge,
    device: &'a str,
}

impl<'a> PrivilegeEscalator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, bridge: &'a Bridge, device: &'a str) -> Self {
        Self {
            runner,
            bridge,
            device,
        }
    }

    /// Run `remote` under each tier, `preferred` first, until one is granted.
    pub async fn escalate(
        &self,
        remote: &RemoteCommand,
        preferred: Option<AccessTier>,
        trace: &mut Trace,
    ) -> Result<Escalated, EscalationError> {
        let command = remote.render();
        let order = AccessTier::order_from(preferred);
        for (idx, tier) in order.iter().copied().enumerate() {
            if idx > 0 {
                trace.push(format!("escalate: {} -> {}", order[idx - 1], tier));
            }
            match self.attempt(remote, tier, trace).await {
                Attempt::Granted(output) => {
                    debug!(device = self.device, %tier, command = %command, "access granted");
                    return Ok(Escalated { output, tier });
                }
                Attempt::Missing => return Err(EscalationError::Missing { command }),
                Attempt::Denied | Attempt::Absent => {}
            }
        }
        Err(EscalationError::Exhausted { command })
    }

    async fn attempt(&self, remote: &RemoteCommand, tier: AccessTier, trace: &mut Trace) -> Attempt {
        let spec = self.bridge.shell(self.device, tier, remote, remote.timeout());
        let attempt = match self.runner.execute(&spec).await {
            Ok(output) => classify(&output),
            Err(err) => {
                trace.push(format!("[{tier}] $ {spec} => {err}"));
                return Attempt::Absent;
            }
        };
        let verdict = match &attempt {
            Attempt::Granted(_) => "ok",
            Attempt::Denied => "permission denied",
            Attempt::Missing => "no such file",
            Attempt::Absent => "no output",
        };
        trace.push(format!("[{tier}] $ {spec} => {verdict}"));
        attempt
    }

    /// `whoami`/`id` under every tier, for failure reports.
    pub async fn collect_diagnostics(&self, trace: &mut Trace) {
        for tier in AccessTier::ORDERED {
            for remote in [RemoteCommand::whoami(), RemoteCommand::id()] {
                let spec = self.bridge.shell(self.device, tier, &remote, remote.timeout());
                let line = match self.runner.execute(&spec).await {
                    Ok(out) => format!(
                        "diag [{tier}] {}: exit {:?}: {}",
                        remote.render(),
                        out.status,
                        out.combined()
                    ),
                    Err(err) => format!("diag [{tier}] {}: {err}", remote.render()),
                };
                trace.push(line);
            }
        }
    }
}

fn classify(output: &RawOutput) -> Attempt {
    let combined = output.combined();
    if combined.contains(PERMISSION_DENIED_MARKER) {
        return Attempt::Denied;
    }
    if !output.success() {
        if combined.contains(NO_SUCH_FILE_MARKER) {
            return Attempt::Missing;
        }
        return Attempt::Absent;
    }
    Attempt::Granted(output.stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandSpec, RunError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Answers shell commands by the tier wrapper in their argv.
    struct TierScript {
        plain: RawOutput,
        su0: RawOutput,
        suc: RawOutput,
        seen: Mutex<Vec<AccessTier>>,
    }

    fn ok(stdout: &str) -> RawOutput {
        RawOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> RawOutput {
        RawOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[async_trait]
    impl CommandRunner for TierScript {
        async fn execute(&self, spec: &CommandSpec) -> Result<RawOutput, RunError> {
            let tier = match spec.args.get(3).map(String::as_str) {
                Some("su") if spec.args.get(4).map(String::as_str) == Some("0") => {
                    AccessTier::SuperuserUid
                }
                Some("su") => AccessTier::SuperuserShell,
                _ => AccessTier::Unprivileged,
            };
            self.seen.lock().push(tier);
            Ok(match tier {
                AccessTier::Unprivileged => self.plain.clone(),
                AccessTier::SuperuserUid => self.su0.clone(),
                AccessTier::SuperuserShell => self.suc.clone(),
            })
        }
    }

    fn script(plain: RawOutput, su0: RawOutput, suc: RawOutput) -> TierScript {
        TierScript {
            plain,
            su0,
            suc,
            seen: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn plain_success_skips_superuser_tiers() {
        let runner = script(ok("-rw-rw---- file"), ok("root"), ok("root"));
        let bridge = Bridge::new("adb");
        let esc = PrivilegeEscalator::new(&runner, &bridge, "D1");
        let mut trace = Trace::new();
        let got = esc
            .escalate(&RemoteCommand::list("/x"), None, &mut trace)
            .await
            .unwrap();
        assert_eq!(got.tier, AccessTier::Unprivileged);
        assert_eq!(*runner.seen.lock(), vec![AccessTier::Unprivileged]);
    }

    #[tokio::test]
    async fn denial_marker_in_successful_output_advances_tier() {
        // Older adb builds exit 0 even when the remote command failed.
        let runner = script(ok("ls: /x: Permission denied"), ok("-rw------- x"), ok("x"));
        let bridge = Bridge::new("adb");
        let esc = PrivilegeEscalator::new(&runner, &bridge, "D1");
        let mut trace = Trace::new();
        let got = esc
            .escalate(&RemoteCommand::list("/x"), None, &mut trace)
            .await
            .unwrap();
        assert_eq!(got.tier, AccessTier::SuperuserUid);
        assert_eq!(got.output, "-rw------- x");
        assert_eq!(trace.lines().filter(|l| l.starts_with("escalate:")).count(), 1);
    }

    #[tokio::test]
    async fn every_tier_failing_is_exhausted() {
        let runner = script(fail("Permission denied"), fail("su: not found"), fail(""));
        let bridge = Bridge::new("adb");
        let esc = PrivilegeEscalator::new(&runner, &bridge, "D1");
        let mut trace = Trace::new();
        let err = esc
            .escalate(&RemoteCommand::list("/x"), None, &mut trace)
            .await
            .unwrap_err();
        assert!(matches!(err, EscalationError::Exhausted { .. }));
        assert_eq!(runner.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn missing_file_stops_escalation() {
        let runner = script(fail("ls: /x: No such file or directory"), ok("x"), ok("x"));
        let bridge = Bridge::new("adb");
        let esc = PrivilegeEscalator::new(&runner, &bridge, "D1");
        let mut trace = Trace::new();
        let err = esc
            .escalate(&RemoteCommand::list("/x"), None, &mut trace)
            .await
            .unwrap_err();
        assert!(matches!(err, EscalationError::Missing { .. }));
        assert_eq!(runner.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn preferred_tier_is_tried_first_then_falls_back_in_order() {
        let runner = script(ok("done"), fail("Permission denied"), ok("done"));
        let bridge = Bridge::new("adb");
        let esc = PrivilegeEscalator::new(&runner, &bridge, "D1");
        let mut trace = Trace::new();
        let got = esc
            .escalate(
                &RemoteCommand::copy("/a", "/b"),
                Some(AccessTier::SuperuserUid),
                &mut trace,
            )
            .await
            .unwrap();
        assert_eq!(got.tier, AccessTier::Unprivileged);
        assert_eq!(
            *runner.seen.lock(),
            vec![AccessTier::SuperuserUid, AccessTier::Unprivileged]
        );
    }

    #[test]
    fn order_from_moves_preferred_to_front() {
        assert_eq!(AccessTier::order_from(None), AccessTier::ORDERED.to_vec());
        assert_eq!(
            AccessTier::order_from(Some(AccessTier::SuperuserShell)),
            vec![
                AccessTier::SuperuserShell,
                AccessTier::Unprivileged,
                AccessTier::SuperuserUid
            ]
        );
    }
}
