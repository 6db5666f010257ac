//! An in-memory `adb` that simulates one bridge host, its attached devices
//! and a device filesystem with per-path access requirements.
//!
//! Every invocation is recorded as `program arg arg ...` so tests can assert
//! on exactly which commands ran.

use crate::bridge::DeviceState;
use crate::escalation::AccessTier;
use crate::runner::{CommandRunner, CommandSpec, RawOutput, RunError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
struct RemoteFile {
    bytes: Vec<u8>,
    min_tier: AccessTier,
}

#[derive(Debug)]
struct World {
    tool_present: bool,
    devices: Vec<(String, DeviceState)>,
    reachable: HashSet<String>,
    connectable: HashMap<String, DeviceState>,
    files: HashMap<String, RemoteFile>,
    su_uid: bool,
    su_shell: bool,
    fail_stage: bool,
    fail_pull: bool,
    fail_cleanup: bool,
    pull_delay: Option<Duration>,
    panics_pending: usize,
}

impl Default for World {
    fn default() -> Self {
        Self {
            tool_present: true,
            devices: Vec::new(),
            reachable: HashSet::new(),
            connectable: HashMap::new(),
            files: HashMap::new(),
            su_uid: true,
            su_shell: true,
            fail_stage: false,
            fail_pull: false,
            fail_cleanup: false,
            pull_delay: None,
            panics_pending: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeBridge {
    world: Mutex<World>,
    calls: Mutex<Vec<String>>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_tool(self) -> Self {
        self.world.lock().tool_present = false;
        self
    }

    pub fn with_device(self, serial: &str, state: DeviceState) -> Self {
        self.set_device_state(serial, state);
        self
    }

    /// Host that answers `ping`.
    pub fn with_reachable(self, host: &str) -> Self {
        self.world.lock().reachable.insert(host.to_string());
        self
    }

    /// Address that `adb connect` attaches in `state`. Its host is made
    /// reachable too.
    pub fn with_connectable(self, address: &str, state: DeviceState) -> Self {
        {
            let mut world = self.world.lock();
            world.connectable.insert(address.to_string(), state);
            let host = address.split(':').next().unwrap_or(address);
            world.reachable.insert(host.to_string());
        }
        self
    }

    /// Remote file readable only from `min_tier` upwards.
    pub fn with_file(self, path: &str, bytes: &[u8], min_tier: AccessTier) -> Self {
        self.world.lock().files.insert(
            path.to_string(),
            RemoteFile {
                bytes: bytes.to_vec(),
                min_tier,
            },
        );
        self
    }

    pub fn without_su_uid(self) -> Self {
        self.world.lock().su_uid = false;
        self
    }

    pub fn without_su_shell(self) -> Self {
        self.world.lock().su_shell = false;
        self
    }

    pub fn failing_stage(self) -> Self {
        self.world.lock().fail_stage = true;
        self
    }

    pub fn failing_pull(self) -> Self {
        self.world.lock().fail_pull = true;
        self
    }

    pub fn failing_cleanup(self) -> Self {
        self.world.lock().fail_cleanup = true;
        self
    }

    /// Every `adb pull` takes `delay` (on the tokio clock) before copying.
    pub fn with_pull_delay(self, delay: Duration) -> Self {
        self.world.lock().pull_delay = Some(delay);
        self
    }

    pub fn set_device_state(&self, serial: &str, state: DeviceState) {
        let mut world = self.world.lock();
        match world.devices.iter_mut().find(|(s, _)| s == serial) {
            Some(entry) => entry.1 = state,
            None => world.devices.push((serial.to_string(), state)),
        }
    }

    pub fn detach_device(&self, serial: &str) {
        let mut world = self.world.lock();
        world.devices.retain(|(s, _)| s != serial);
        world.connectable.remove(serial);
    }

    /// The next `adb version` call panics.
    pub fn panic_on_next_run(&self) {
        self.world.lock().panics_pending += 1;
    }

    pub fn remote_file_exists(&self, path: &str) -> bool {
        self.world.lock().files.contains_key(path)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Number of pipeline runs started, each of which opens with `adb version`.
    pub fn pipeline_runs(&self) -> usize {
        self.count_calls("adb version")
    }

    fn adb(&self, args: &[String]) -> Result<RawOutput, RunError> {
        let mut world = self.world.lock();
        if !world.tool_present {
            return Err(RunError::Spawn {
                program: "adb".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["version"] => {
                if world.panics_pending > 0 {
                    world.panics_pending -= 1;
                    drop(world);
                    panic!("simulated bridge crash");
                }
                Ok(ok("Android Debug Bridge version 1.0.41\nVersion 34.0.5-fake\n"))
            }
            ["devices"] => {
                let mut out = String::from("List of devices attached\n");
                for (serial, state) in &world.devices {
                    out.push_str(&format!("{serial}\t{}\n", state_word(*state)));
                }
                Ok(ok(&out))
            }
            ["connect", address] => {
                let Some(state) = world.connectable.get(*address).copied() else {
                    return Ok(fail_out(&format!(
                        "failed to connect to '{address}': Connection refused\n"
                    )));
                };
                let already = world.devices.iter().any(|(s, _)| s == address);
                drop(world);
                self.set_device_state(address, state);
                if already {
                    Ok(ok(&format!("already connected to {address}\n")))
                } else {
                    Ok(ok(&format!("connected to {address}\n")))
                }
            }
            ["-s", device, rest @ ..] => {
                let online = world
                    .devices
                    .iter()
                    .any(|(s, st)| s == device && *st == DeviceState::Online);
                if !online {
                    return Ok(fail(&format!("adb: device '{device}' not found")));
                }
                match rest {
                    ["shell", words @ ..] => Ok(shell(&mut world, words)),
                    ["pull", remote, local] => Ok(pull(&world, remote, Path::new(local))),
                    _ => Ok(fail("adb: usage error")),
                }
            }
            _ => Ok(fail("adb: unknown command")),
        }
    }

    fn ping(&self, args: &[String]) -> RawOutput {
        let host = args.last().map(String::as_str).unwrap_or_default();
        if self.world.lock().reachable.contains(host) {
            ok("1 packets transmitted, 1 received, 0% packet loss\n")
        } else {
            RawOutput {
                status: Some(1),
                stdout: "1 packets transmitted, 0 received, 100% packet loss\n".to_string(),
                stderr: String::new(),
            }
        }
    }
}

#[async_trait]
impl CommandRunner for FakeBridge {
    async fn execute(&self, spec: &CommandSpec) -> Result<RawOutput, RunError> {
        let mut line = spec.program.clone();
        for arg in &spec.args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().push(line);

        if spec.args.get(2).map(String::as_str) == Some("pull") {
            let delay = self.world.lock().pull_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        match spec.program.as_str() {
            "adb" => self.adb(&spec.args),
            "ping" => Ok(self.ping(&spec.args)),
            other => Err(RunError::Spawn {
                program: other.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "not simulated"),
            }),
        }
    }
}

fn state_word(state: DeviceState) -> &'static str {
    match state {
        DeviceState::Online => "device",
        DeviceState::Unauthorized => "unauthorized",
        DeviceState::Offline => "offline",
        DeviceState::Other => "recovery",
    }
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

fn fail_out(stdout: &str) -> RawOutput {
    RawOutput {
        status: Some(1),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn shell(world: &mut World, words: &[&str]) -> RawOutput {
    let (tier, command) = match words {
        ["su", "0", rest @ ..] => {
            if !world.su_uid {
                return fail("su: invalid option -- 0");
            }
            (AccessTier::SuperuserUid, rest.join(" "))
        }
        ["su", "-c", rest @ ..] => {
            if !world.su_shell {
                return fail("/system/bin/sh: su: inaccessible or not found");
            }
            let inner = split_words(&rest.join(" "));
            (AccessTier::SuperuserShell, inner.join(" "))
        }
        _ => (AccessTier::Unprivileged, words.join(" ")),
    };
    let argv = split_words(&command);
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    match argv.as_slice() {
        ["ls", "-l", path] => match world.files.get(*path) {
            None => fail(&format!("ls: {path}: No such file or directory")),
            Some(file) if tier < file.min_tier => fail(&format!("ls: {path}: Permission denied")),
            Some(file) => ok(&format!(
                "-rw-rw---- 1 u0_a201 u0_a201 {} 2024-03-01 08:15 {path}\n",
                file.bytes.len()
            )),
        },
        ["cp", src, dst] => {
            let Some(file) = world.files.get(*src).cloned() else {
                return fail(&format!("cp: {src}: No such file or directory"));
            };
            if tier < file.min_tier {
                return fail(&format!("cp: {src}: Permission denied"));
            }
            if world.fail_stage {
                return fail(&format!("cp: {dst}: Read-only file system"));
            }
            world.files.insert(
                dst.to_string(),
                RemoteFile {
                    bytes: file.bytes,
                    min_tier: AccessTier::Unprivileged,
                },
            );
            ok("")
        }
        ["rm", "-f", path] => {
            if world.fail_cleanup {
                return fail(&format!("rm: {path}: Read-only file system"));
            }
            world.files.remove(*path);
            ok("")
        }
        ["whoami"] => ok(if tier == AccessTier::Unprivileged {
            "shell\n"
        } else {
            "root\n"
        }),
        ["id"] => ok(if tier == AccessTier::Unprivileged {
            "uid=2000(shell) gid=2000(shell)\n"
        } else {
            "uid=0(root) gid=0(root)\n"
        }),
        _ => RawOutput {
            status: Some(127),
            stdout: String::new(),
            stderr: format!("/system/bin/sh: {command}: not found"),
        },
    }
}

fn pull(world: &World, remote: &str, local: &Path) -> RawOutput {
    if world.fail_pull {
        return fail("adb: error: failed to copy: connection reset");
    }
    let Some(file) = world.files.get(remote) else {
        return fail(&format!(
            "adb: error: failed to stat remote object '{remote}': No such file or directory"
        ));
    };
    if file.min_tier > AccessTier::Unprivileged {
        return fail(&format!(
            "adb: error: failed to stat remote object '{remote}': Permission denied"
        ));
    }
    if let Err(err) = std::fs::write(local, &file.bytes) {
        return fail(&format!("adb: error: cannot create '{}': {err}", local.display()));
    }
    ok(&format!("{remote}: 1 file pulled, 0 skipped. ({} bytes)\n", file.bytes.len()))
}

/// Split a device shell command line into words, honouring single quotes
/// and backslash escapes.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
