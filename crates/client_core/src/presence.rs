use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use shared::domain::{PresenceRecord, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// No update has ever been observed for this user.
    Unknown,
    Known(PresenceRecord),
}

/// In-memory last-write-wins presence map, fed only by channel pushes.
/// Entries are never expired: in the absence of updates the last known
/// state stands.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: Mutex<HashMap<UserId, PresenceRecord>>,
}

impl PresenceTracker {
    /// Apply a pushed record. Returns true when the stored state changed so
    /// the owner can notify subscribers exactly once per transition.
    pub fn observe(&self, record: PresenceRecord) -> bool {
        let mut records = self.lock_records();
        match records.get(&record.user_id) {
            Some(existing) if *existing == record => false,
            _ => {
                records.insert(record.user_id.clone(), record);
                true
            }
        }
    }

    /// Last known state for the user, or `Unknown`. Never fails.
    pub fn get(&self, user_id: &UserId) -> Presence {
        self.lock_records()
            .get(user_id)
            .cloned()
            .map(Presence::Known)
            .unwrap_or(Presence::Unknown)
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<UserId, PresenceRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn online(user: &str) -> PresenceRecord {
        PresenceRecord {
            user_id: UserId::new(user),
            online: true,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn unknown_until_first_observation() {
        let tracker = PresenceTracker::default();
        assert_eq!(tracker.get(&UserId::new("u-1")), Presence::Unknown);
    }

    #[test]
    fn observe_reports_changes_only() {
        let tracker = PresenceTracker::default();
        let record = online("u-1");
        assert!(tracker.observe(record.clone()));
        assert!(!tracker.observe(record.clone()));

        let mut offline = record.clone();
        offline.online = false;
        assert!(tracker.observe(offline.clone()));
        assert_eq!(tracker.get(&record.user_id), Presence::Known(offline));
    }
}
