use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "tether";
pub const APP_NAME: &str = "tether";

/// Bridge binary used when `TETHER_ADB` is not set.
pub const DEFAULT_BRIDGE_PROGRAM: &str = "adb";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("TETHER_DATA_DIR") {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

/// Directory the pulled file is materialized into.
pub fn local_store_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("db")
}

pub fn control_socket_path(data_dir: &Path) -> PathBuf {
    if let Ok(override_path) = std::env::var("TETHER_CONTROL_SOCKET") {
        if !override_path.is_empty() {
            return PathBuf::from(override_path);
        }
    }
    data_dir.join("tether.sock")
}

pub fn bridge_program() -> String {
    match std::env::var("TETHER_ADB") {
        Ok(program) if !program.trim().is_empty() => program,
        _ => DEFAULT_BRIDGE_PROGRAM.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_live_under_data_dir() {
        let base = Path::new("/var/lib/tether");
        assert_eq!(config_path(base), base.join("config.json"));
        assert_eq!(local_store_dir(base), base.join("db"));
    }
}
