use crate::activity::ActivityLog;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tether_core::config::{ConfigStore, PersistedConfig};
use tether_core::ipc::RunSummary;
use tracing::warn;

pub struct ServiceState {
    pub config: PersistedConfig,
    pub running: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<RunSummary>,
}

/// The one synchronized copy of configuration and live status.
///
/// Persisted fields are written back to disk while the lock is still held,
/// so the file always reflects a state that existed in memory. A failed write
/// is logged and the in-memory state stays authoritative.
pub struct SharedState {
    inner: Mutex<ServiceState>,
    store: ConfigStore,
    activity: ActivityLog,
    started_at: DateTime<Utc>,
}

impl SharedState {
    pub fn new(store: ConfigStore, config: PersistedConfig) -> Self {
        Self {
            inner: Mutex::new(ServiceState {
                config,
                running: false,
                next_run_at: None,
                last_run: None,
            }),
            store,
            activity: ActivityLog::new(),
            started_at: Utc::now(),
        }
    }

    /// Load (and migrate) the document, then write it back in current form.
    pub fn load(store: ConfigStore) -> Result<Self> {
        let config = store
            .load()
            .with_context(|| format!("load config {}", store.path().display()))?;
        let state = Self::new(store, config);
        state.update(|_| ());
        Ok(state)
    }

    pub fn read<R>(&self, f: impl FnOnce(&ServiceState) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Mutate and persist.
    pub fn update<R>(&self, f: impl FnOnce(&mut ServiceState) -> R) -> R {
        let mut guard = self.inner.lock();
        let out = f(&mut guard);
        // Blocking write under the lock: the file only ever holds a whole
        // document that existed in memory, and writers queue behind it.
        if let Err(err) = self.store.save(&guard.config) {
            warn!(path = %self.store.path().display(), error = %err, "config write-back failed");
        }
        out
    }

    /// Mutate fields that are never persisted.
    pub fn update_transient<R>(&self, f: impl FnOnce(&mut ServiceState) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn config(&self) -> PersistedConfig {
        self.inner.lock().config.clone()
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_rewrites_legacy_document_in_current_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"auto_enabled": false, "interval_minutes": 10, "adb_ips": []}"#)
            .unwrap();
        let state = SharedState::load(ConfigStore::new(&path)).unwrap();
        assert_eq!(state.read(|s| s.config.scheduler.interval_minutes), 10);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"schemaVersion\": 2"));
    }

    #[test]
    fn concurrent_updates_leave_every_change_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let state = SharedState::new(ConfigStore::new(&path), PersistedConfig::default());
        std::thread::scope(|scope| {
            for i in 0..8 {
                let state = &state;
                scope.spawn(move || {
                    state.update(|s| s.config.register_device(&format!("10.0.0.{i}:5555"), None));
                });
            }
        });
        let raw = std::fs::read_to_string(&path).unwrap();
        let saved = PersistedConfig::from_json(&raw).unwrap();
        assert_eq!(saved.devices.len(), 8);
        assert_eq!(saved, state.config());
    }

    #[test]
    fn transient_updates_do_not_touch_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let state = SharedState::new(ConfigStore::new(&path), PersistedConfig::default());
        state.update_transient(|s| s.running = true);
        assert!(!path.exists());
        state.update(|s| s.config.set_interval(9));
        assert!(path.exists());
    }
}
