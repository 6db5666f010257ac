//! Argument builders for the `adb` bridge and parsing of its text output.
//!
//! Nothing here spawns processes; [`Bridge`] only turns intents into
//! [`CommandSpec`]s so the same commands can be fed to the real runner or to a
//! scripted one.

use crate::escalation::AccessTier;
use crate::runner::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEVICES_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHELL_TIMEOUT: Duration = Duration::from_secs(10);
pub const COPY_TIMEOUT: Duration = Duration::from_secs(15);
pub const PULL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    program: String,
}

impl Bridge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Uses `TETHER_ADB` when set, `adb` otherwise.
    pub fn from_env() -> Self {
        Self::new(crate::paths::bridge_program())
    }

    pub fn version(&self) -> CommandSpec {
        CommandSpec::new(&self.program, VERSION_TIMEOUT).arg("version")
    }

    pub fn devices(&self) -> CommandSpec {
        CommandSpec::new(&self.program, DEVICES_TIMEOUT).arg("devices")
    }

    pub fn connect(&self, address: &str) -> CommandSpec {
        CommandSpec::new(&self.program, CONNECT_TIMEOUT)
            .arg("connect")
            .arg(address)
    }

    /// `adb -s DEVICE shell ...` wrapped for the requested access tier.
    ///
    /// adb joins everything after `shell` with spaces before handing it to the
    /// device shell, so the `su -c` form must carry the command as one quoted
    /// word.
    pub fn shell(
        &self,
        device: &str,
        tier: AccessTier,
        remote: &RemoteCommand,
        timeout: Duration,
    ) -> CommandSpec {
        let base = CommandSpec::new(&self.program, timeout).args(["-s", device, "shell"]);
        match tier {
            AccessTier::Unprivileged => base.arg(remote.render()),
            AccessTier::SuperuserUid => base.args(["su", "0"]).arg(remote.render()),
            AccessTier::SuperuserShell => base
                .args(["su", "-c"])
                .arg(shell_quote(&remote.render())),
        }
    }

    pub fn pull(&self, device: &str, remote: &str, local: &Path) -> CommandSpec {
        CommandSpec::new(&self.program, PULL_TIMEOUT)
            .args(["-s", device, "pull", remote])
            .arg(local.display().to_string())
    }
}

/// A command line to run inside the device shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    words: Vec<String>,
    timeout: Duration,
}

impl RemoteCommand {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
            timeout: SHELL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn list(path: &str) -> Self {
        Self::new(["ls", "-l", path])
    }

    pub fn copy(src: &str, dst: &str) -> Self {
        Self::new(["cp", src, dst]).with_timeout(COPY_TIMEOUT)
    }

    pub fn remove(path: &str) -> Self {
        Self::new(["rm", "-f", path])
    }

    pub fn whoami() -> Self {
        Self::new(["whoami"])
    }

    pub fn id() -> Self {
        Self::new(["id"])
    }

    pub fn render(&self) -> String {
        self.words
            .iter()
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// POSIX single-quote a word unless it is made only of safe characters.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Unauthorized,
    Offline,
    Other,
}

impl DeviceState {
    fn parse(raw: &str) -> Self {
        match raw {
            "device" => DeviceState::Online,
            "unauthorized" => DeviceState::Unauthorized,
            "offline" => DeviceState::Offline,
            _ => DeviceState::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    pub state: DeviceState,
}

/// Parse `adb devices` output. Header and daemon chatter lines are skipped.
pub fn parse_device_list(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(DeviceEntry {
                serial: serial.to_string(),
                state: DeviceState::parse(state),
            })
        })
        .collect()
}

/// Whether a device-list serial refers to a registered address. A bare host
/// matches any port on that host.
pub fn matches_address(serial: &str, address: &str) -> bool {
    if serial == address {
        return true;
    }
    !address.contains(':') && serial.split(':').next() == Some(address)
}
