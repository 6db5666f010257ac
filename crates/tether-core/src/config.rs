//! The persisted runtime document (`config.json`) and its migration.
//!
//! The file is rewritten in full after every mutation. Writes go to a sibling
//! temp file that is synced and then renamed over the original, so a crash
//! leaves either the old or the new document on disk.

use crate::escalation::AccessTier;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 1440;
pub const DEFAULT_INTERVAL_MINUTES: u32 = 5;

pub const DEFAULT_CANDIDATE_PATHS: [&str; 3] = [
    "/data/data/com.bca.bcatrack/cache/cache/data/sql.db",
    "/data/user/0/com.bca.bcatrack/cache/cache/data/sql.db",
    "/data/data/com.bca.bcatrack/databases/sql.db",
];
pub const DEFAULT_STAGING_PATH: &str = "/sdcard/sql.db";
pub const DEFAULT_LOCAL_FILE_NAME: &str = "sql.db";
pub const DEFAULT_COUNT_TABLES: [&str; 2] = ["DWJJOB", "DWVVEH"];

const LEGACY_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn clamp_interval(minutes: u64) -> u32 {
    minutes.clamp(MIN_INTERVAL_MINUTES as u64, MAX_INTERVAL_MINUTES as u64) as u32
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config document is malformed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config schema version {0} is newer than supported version {max}", max = CURRENT_SCHEMA_VERSION)]
    UnsupportedVersion(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub address: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastExtraction {
    pub finished_at: DateTime<Utc>,
    pub device: Option<String>,
    pub source_path: Option<String>,
    pub tier: Option<AccessTier>,
    #[serde(default)]
    pub row_counts: BTreeMap<String, u64>,
}

/// Where the file lives on the device and what to count once it is local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceSettings {
    pub candidate_paths: Vec<String>,
    pub staging_path: String,
    pub local_file_name: String,
    pub count_tables: Vec<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            candidate_paths: DEFAULT_CANDIDATE_PATHS.iter().map(|p| p.to_string()).collect(),
            staging_path: DEFAULT_STAGING_PATH.to_string(),
            local_file_name: DEFAULT_LOCAL_FILE_NAME.to_string(),
            count_tables: DEFAULT_COUNT_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub preferred_device: Option<String>,
    #[serde(default)]
    pub last_extraction: Option<LastExtraction>,
    #[serde(default)]
    pub source: SourceSettings,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            scheduler: SchedulerSettings::default(),
            devices: Vec::new(),
            preferred_device: None,
            last_extraction: None,
            source: SourceSettings::default(),
        }
    }
}

impl PersistedConfig {
    /// Clamp and store the interval, returning the value kept.
    pub fn set_interval(&mut self, minutes: u64) -> u32 {
        self.scheduler.interval_minutes = clamp_interval(minutes);
        self.scheduler.interval_minutes
    }

    pub fn device(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.address.clone()).collect()
    }

    /// Add a device unless the address is already registered. Returns whether
    /// the registry changed.
    pub fn register_device(&mut self, address: &str, display_name: Option<&str>) -> bool {
        if self.device(address).is_some() {
            return false;
        }
        let display_name = match display_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("Device {}", self.devices.len() + 1),
        };
        self.devices.push(DeviceRecord {
            address: address.to_string(),
            display_name,
        });
        true
    }

    pub fn unregister_device(&mut self, address: &str) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.address != address);
        if self.preferred_device.as_deref() == Some(address) {
            self.preferred_device = None;
        }
        self.devices.len() != before
    }

    pub fn rename_device(&mut self, address: &str, display_name: &str) -> bool {
        match self.devices.iter_mut().find(|d| d.address == address) {
            Some(device) => {
                device.display_name = display_name.to_string();
                true
            }
            None => false,
        }
    }

    /// Mark a registered device as preferred and return its display name.
    pub fn set_preferred_device(&mut self, address: &str) -> Option<String> {
        let name = self.device(address)?.display_name.clone();
        self.preferred_device = Some(address.to_string());
        Some(name)
    }

    /// Parse a document of any supported schema, migrating it if needed.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        match value.get("schemaVersion").and_then(serde_json::Value::as_u64) {
            Some(version) if version > CURRENT_SCHEMA_VERSION as u64 => {
                Err(ConfigError::UnsupportedVersion(version))
            }
            Some(_) => {
                let mut config: PersistedConfig = serde_json::from_value(value)?;
                config.normalize();
                Ok(config)
            }
            None => {
                let legacy: LegacyConfig = serde_json::from_value(value)?;
                info!("migrating flat config document to schema {CURRENT_SCHEMA_VERSION}");
                Ok(legacy.migrate())
            }
        }
    }

    fn normalize(&mut self) {
        self.schema_version = CURRENT_SCHEMA_VERSION;
        self.scheduler.interval_minutes = clamp_interval(self.scheduler.interval_minutes as u64);
    }
}

/// The flat document written by earlier releases.
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    auto_enabled: bool,
    /// Older writers stored whatever number they were sent, `5.0` included.
    #[serde(default)]
    interval_minutes: Option<f64>,
    #[serde(default)]
    last_sql_atime: Option<String>,
    #[serde(default)]
    last_locations: Option<u64>,
    #[serde(default)]
    last_cars: Option<u64>,
    #[serde(default)]
    adb_ips: Vec<LegacyDevice>,
    #[serde(default)]
    preferred_device: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyDevice {
    Bare(String),
    Named {
        ip: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl LegacyConfig {
    fn migrate(self) -> PersistedConfig {
        let mut config = PersistedConfig::default();
        config.scheduler.enabled = self.auto_enabled;
        config.scheduler.interval_minutes = self
            .interval_minutes
            .map(|m| clamp_interval(m.round().max(0.0) as u64))
            .unwrap_or(DEFAULT_INTERVAL_MINUTES);

        for device in self.adb_ips {
            let (address, name) = match device {
                LegacyDevice::Bare(ip) => (ip, None),
                LegacyDevice::Named { ip, name } => (ip, name),
            };
            config.register_device(&address, name.as_deref());
        }
        let preferred = self
            .preferred_device
            .filter(|address| config.device(address).is_some());
        config.preferred_device = preferred;

        if let Some(finished_at) = self.last_sql_atime.as_deref().and_then(parse_legacy_time) {
            let mut row_counts = BTreeMap::new();
            if let Some(n) = self.last_locations {
                row_counts.insert(DEFAULT_COUNT_TABLES[0].to_string(), n);
            }
            if let Some(n) = self.last_cars {
                row_counts.insert(DEFAULT_COUNT_TABLES[1].to_string(), n);
            }
            config.last_extraction = Some(LastExtraction {
                finished_at,
                device: None,
                source_path: None,
                tier: None,
                row_counts,
            });
        }
        config
    }
}

fn parse_legacy_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, LEGACY_DATETIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Reads and atomically rewrites `config.json`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file yields the defaults.
    pub fn load(&self) -> Result<PersistedConfig, ConfigError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(PersistedConfig::default())
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    action: "read",
                    path: self.path.clone(),
                    source,
                })
            }
        };
        PersistedConfig::from_json(&raw)
    }

    pub fn save(&self, config: &PersistedConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error("create", parent))?;
        }
        let mut bytes = serde_json::to_vec_pretty(config)?;
        bytes.push(b'\n');

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path).map_err(io_error("create", &temp_path))?;
            file.write_all(&bytes).map_err(io_error("write", &temp_path))?;
            file.sync_all().map_err(io_error("sync", &temp_path))?;
        }
        fs::rename(&temp_path, &self.path).map_err(io_error("rename", &temp_path))?;
        Ok(())
    }
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> ConfigError {
    let path = path.to_path_buf();
    move |source| ConfigError::Io {
        action,
        path,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use tempfile::tempdir;

    #[test]
    fn interval_is_clamped() {
        assert_eq!(clamp_interval(0), 1);
        assert_eq!(clamp_interval(99_999), 1440);
        assert_eq!(clamp_interval(30), 30);
        let mut config = PersistedConfig::default();
        assert_eq!(config.set_interval(0), 1);
        assert_eq!(config.scheduler.interval_minutes, 1);
    }

    #[test]
    fn register_is_idempotent_and_names_default_by_position() {
        let mut config = PersistedConfig::default();
        assert!(config.register_device("10.0.0.5:5555", Some("Van1")));
        assert!(!config.register_device("10.0.0.5:5555", Some("Other")));
        assert!(config.register_device("10.0.0.6:5555", None));
        assert_eq!(config.devices[0].display_name, "Van1");
        assert_eq!(config.devices[1].display_name, "Device 2");
    }

    #[test]
    fn unregistering_preferred_device_clears_preference() {
        let mut config = PersistedConfig::default();
        config.register_device("10.0.0.5:5555", None);
        assert_eq!(
            config.set_preferred_device("10.0.0.5:5555").as_deref(),
            Some("Device 1")
        );
        assert!(config.set_preferred_device("10.0.0.9:5555").is_none());
        assert!(config.unregister_device("10.0.0.5:5555"));
        assert!(config.preferred_device.is_none());
        assert!(!config.unregister_device("10.0.0.5:5555"));
    }

    #[test]
    fn flat_document_migrates() {
        let raw = r#"{
            "auto_enabled": true,
            "interval_minutes": 0,
            "last_sql_atime": "2024-03-01 08:15:30",
            "last_locations": 120,
            "last_cars": 45,
            "last_loads": 7,
            "webhook_enabled": true,
            "webhook_port": 8765,
            "adb_ips": ["10.0.0.5:5555", {"ip": "10.0.0.6:5555", "name": "Van2"}],
            "preferred_device": "10.0.0.6:5555"
        }"#;
        let config = PersistedConfig::from_json(raw).unwrap();
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.interval_minutes, 1);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].display_name, "Device 1");
        assert_eq!(config.devices[1].display_name, "Van2");
        assert_eq!(config.preferred_device.as_deref(), Some("10.0.0.6:5555"));
        let last = config.last_extraction.unwrap();
        assert_eq!(last.finished_at.hour(), 8);
        assert_eq!(last.row_counts["DWJJOB"], 120);
        assert_eq!(last.row_counts["DWVVEH"], 45);
        assert_eq!(config.source, SourceSettings::default());
    }

    #[test]
    fn flat_document_with_fractional_interval_migrates() {
        let raw = r#"{"auto_enabled": true, "interval_minutes": 5.0, "adb_ips": ["10.0.0.5:5555"]}"#;
        let config = PersistedConfig::from_json(raw).unwrap();
        assert_eq!(config.scheduler.interval_minutes, 5);
        assert_eq!(config.devices.len(), 1);

        let rounded = PersistedConfig::from_json(r#"{"interval_minutes": 7.6}"#).unwrap();
        assert_eq!(rounded.scheduler.interval_minutes, 8);
        let huge = PersistedConfig::from_json(r#"{"interval_minutes": 1e12}"#).unwrap();
        assert_eq!(huge.scheduler.interval_minutes, MAX_INTERVAL_MINUTES);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let err = PersistedConfig::from_json(r#"{"schemaVersion": 99}"#).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(99)));
    }

    #[test]
    fn save_replaces_file_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join("config.json"));
        assert_eq!(store.load().unwrap(), PersistedConfig::default());

        let mut config = PersistedConfig::default();
        config.register_device("10.0.0.5:5555", Some("Van1"));
        store.save(&config).unwrap();
        config.set_interval(15);
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, config);
        let names: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["config.json"]);
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"schemaVersion\": 2"));
        assert!(raw.contains("\"intervalMinutes\": 15"));
    }
}
