//! Online/offline tracking for conversation participants.

use std::collections::BTreeMap;

use convo_sync_types::{Timestamp, UserId};
use serde::Serialize;

use crate::kv::{KeyValueStore, SharedKeyValueStore};

/// Presence of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    /// The user.
    pub user_id: UserId,
    /// Whether the user is currently online.
    pub online: bool,
    /// When the user was last seen, if known.
    pub last_seen: Option<Timestamp>,
}

/// Maintains the online set and last-seen times.
///
/// Presence starts out unknown and becomes known with the first snapshot.
/// While unknown, [`PresenceTracker::is_online`] answers `false` for
/// everyone; incremental events are still recorded.
pub struct PresenceTracker {
    entries: BTreeMap<UserId, PresenceEntry>,
    known: bool,
    kv: SharedKeyValueStore,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("entries", &self.entries)
            .field("known", &self.known)
            .finish()
    }
}

impl PresenceTracker {
    /// Create a tracker in the unknown state.
    pub fn new(kv: SharedKeyValueStore) -> Self {
        Self {
            entries: BTreeMap::new(),
            known: false,
            kv,
        }
    }

    /// Replace the online set. Users not listed become offline; last-seen
    /// values are left as they were.
    pub fn apply_snapshot(&mut self, online: &[UserId]) {
        for entry in self.entries.values_mut() {
            entry.online = false;
        }
        for user in online {
            self.entry(*user).online = true;
        }
        self.known = true;
        tracing::debug!(online = online.len(), "presence snapshot applied");
    }

    /// A user came online.
    pub fn set_online(&mut self, user: UserId) {
        self.entry(user).online = true;
    }

    /// A user went offline.
    pub fn set_offline(&mut self, user: UserId, last_seen: Option<Timestamp>) {
        let entry = self.entry(user);
        entry.online = false;
        if let Some(ts) = last_seen {
            entry.last_seen = Some(ts);
            self.kv.put(&last_seen_key(user), ts.as_millis().to_string());
        }
    }

    /// Whether `user` is online. Always false while presence is unknown.
    pub fn is_online(&self, user: UserId) -> bool {
        self.known && self.entries.get(&user).is_some_and(|e| e.online)
    }

    /// Last-seen time, falling back to the value remembered in the
    /// key-value store from an earlier session of this conversation.
    pub fn last_seen(&self, user: UserId) -> Option<Timestamp> {
        self.entries
            .get(&user)
            .and_then(|e| e.last_seen)
            .or_else(|| {
                self.kv
                    .get(&last_seen_key(user))
                    .and_then(|v| v.parse().ok())
                    .map(Timestamp::from_millis)
            })
    }

    /// Forget the online set until the next snapshot.
    pub fn mark_unknown(&mut self) {
        self.known = false;
    }

    /// Whether a snapshot has been applied since the last invalidation.
    pub fn is_known(&self) -> bool {
        self.known
    }

    /// Users currently online, in id order.
    pub fn online_users(&self) -> Vec<UserId> {
        if !self.known {
            return Vec::new();
        }
        self.entries
            .values()
            .filter(|e| e.online)
            .map(|e| e.user_id)
            .collect()
    }

    /// Presence of every user seen so far, as the renderer should show it.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.entries
            .values()
            .map(|e| PresenceEntry {
                online: self.known && e.online,
                last_seen: self.last_seen(e.user_id),
                ..*e
            })
            .collect()
    }

    fn entry(&mut self, user: UserId) -> &mut PresenceEntry {
        self.entries.entry(user).or_insert(PresenceEntry {
            user_id: user,
            online: false,
            last_seen: None,
        })
    }
}

fn last_seen_key(user: UserId) -> String {
    format!("presence.last_seen.{user}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;
    use std::sync::Arc;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(MemoryKeyValueStore::shared())
    }

    #[test]
    fn snapshot_replaces_online_set() {
        let mut presence = tracker();
        presence.apply_snapshot(&[UserId::new(1), UserId::new(2)]);
        presence.apply_snapshot(&[UserId::new(2), UserId::new(3)]);

        assert!(!presence.is_online(UserId::new(1)));
        assert!(presence.is_online(UserId::new(2)));
        assert!(presence.is_online(UserId::new(3)));
        assert_eq!(presence.online_users(), vec![UserId::new(2), UserId::new(3)]);
    }

    #[test]
    fn incremental_events_last_wins() {
        let mut presence = tracker();
        presence.apply_snapshot(&[]);

        presence.set_online(UserId::new(5));
        presence.set_offline(UserId::new(5), Some(Timestamp::from_millis(100)));
        assert!(!presence.is_online(UserId::new(5)));

        presence.set_online(UserId::new(5));
        assert!(presence.is_online(UserId::new(5)));
        assert_eq!(presence.last_seen(UserId::new(5)), Some(Timestamp::from_millis(100)));
    }

    #[test]
    fn unknown_until_snapshot() {
        let mut presence = tracker();
        presence.set_online(UserId::new(1));
        assert!(!presence.is_known());
        assert!(!presence.is_online(UserId::new(1)));

        presence.apply_snapshot(&[UserId::new(1)]);
        assert!(presence.is_online(UserId::new(1)));

        presence.mark_unknown();
        assert!(!presence.is_online(UserId::new(1)));
        assert!(presence.online_users().is_empty());
        assert!(!presence.entries()[0].online);
    }

    #[test]
    fn snapshot_keeps_last_seen() {
        let mut presence = tracker();
        presence.set_offline(UserId::new(1), Some(Timestamp::from_millis(50)));
        presence.apply_snapshot(&[]);
        assert_eq!(presence.last_seen(UserId::new(1)), Some(Timestamp::from_millis(50)));
    }

    #[test]
    fn last_seen_survives_in_kv() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let mut first = PresenceTracker::new(kv.clone());
        first.set_offline(UserId::new(9), Some(Timestamp::from_millis(1234)));

        let second = PresenceTracker::new(kv.clone());
        assert_eq!(second.last_seen(UserId::new(9)), Some(Timestamp::from_millis(1234)));
        assert_eq!(kv.get("presence.last_seen.9").as_deref(), Some("1234"));
    }
}
