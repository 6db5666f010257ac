use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tether_core::ipc::ActivityEntry;
use tracing::info;

/// Entries kept for `GetEvents`.
pub const ACTIVITY_LIMIT: usize = 100;

/// Bounded in-memory record of notable service events.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "tether::activity", "{message}");
        let mut entries = self.entries.lock();
        if entries.len() == ACTIVITY_LIMIT {
            entries.pop_front();
        }
        entries.push_back(ActivityEntry {
            timestamp: Utc::now(),
            message,
        });
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<ActivityEntry> {
        let entries = self.entries.lock();
        let limit = limit.unwrap_or(ACTIVITY_LIMIT).min(entries.len());
        entries.iter().skip(entries.len() - limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_entries() {
        let log = ActivityLog::new();
        for i in 0..ACTIVITY_LIMIT + 5 {
            log.record(format!("event {i}"));
        }
        let all = log.recent(None);
        assert_eq!(all.len(), ACTIVITY_LIMIT);
        assert_eq!(all[0].message, "event 5");
        let last_two = log.recent(Some(2));
        assert_eq!(last_two[1].message, format!("event {}", ACTIVITY_LIMIT + 4));
    }
}
