//! One-shot external command execution with a hard timeout.
//!
//! Every bridge interaction funnels through [`CommandRunner`]. Callers that
//! only care whether a command produced output use [`CommandRunner::run`],
//! which folds non-zero exits, timeouts and spawn failures into `None`.
//! Callers that need the exit status or stderr (probe transcripts, tool
//! detection) use [`CommandRunner::execute`].

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

/// Output longer than this is cut before it reaches the logs.
const LOG_OUTPUT_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout and stderr together, for marker matching.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

impl RunError {
    /// True when the program itself could not be found or executed.
    pub fn is_missing_program(&self) -> bool {
        match self {
            RunError::Spawn { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            RunError::Timeout { .. } => false,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, spec: &CommandSpec) -> Result<RawOutput, RunError>;

    /// Trimmed stdout on a zero exit, `None` otherwise.
    async fn run(&self, spec: &CommandSpec) -> Option<String> {
        match self.execute(spec).await {
            Ok(output) if output.success() => Some(output.stdout.trim().to_string()),
            Ok(output) => {
                debug!(
                    command = %spec,
                    status = ?output.status,
                    stderr = %truncate(output.stderr.trim(), LOG_OUTPUT_LIMIT),
                    "command exited unsuccessfully"
                );
                None
            }
            Err(err) => {
                debug!(command = %spec, error = %err, "command did not complete");
                None
            }
        }
    }
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<RawOutput, RunError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(spec.timeout, command.output()).await {
            Ok(result) => result.map_err(|source| RunError::Spawn {
                program: spec.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(RunError::Timeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                })
            }
        };

        let raw = RawOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        trace!(
            command = %spec,
            status = ?raw.status,
            stdout = %truncate(raw.stdout.trim(), LOG_OUTPUT_LIMIT),
            "command finished"
        );
        Ok(raw)
    }
}

/// Cut `text` to at most `limit` bytes on a char boundary.
pub fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec::new(program, Duration::from_secs(5)).args(args.iter().copied())
    }

    #[tokio::test]
    async fn run_returns_trimmed_stdout() {
        let out = SystemRunner::new().run(&spec("echo", &["hello"])).await;
        assert_eq!(out.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_absent() {
        assert!(SystemRunner::new().run(&spec("false", &[])).await.is_none());
    }

    #[tokio::test]
    async fn missing_program_is_reported_as_spawn_failure() {
        let err = SystemRunner::new()
            .execute(&spec("nonexistent_bridge_binary_12345", &[]))
            .await
            .unwrap_err();
        assert!(err.is_missing_program());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let slow = CommandSpec::new("sleep", Duration::from_millis(100)).arg("10");
        let err = SystemRunner::new().execute(&slow).await.unwrap_err();
        assert!(matches!(err, RunError::Timeout { .. }));
        assert!(SystemRunner::new().run(&slow).await.is_none());
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let s = spec("adb", &["shell", "ls -l /sdcard"]);
        assert_eq!(s.to_string(), "adb shell \"ls -l /sdcard\"");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
