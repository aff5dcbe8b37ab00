//! Timer arena for convo-sync.
//!
//! Every timer a conversation owns (send timeouts, typing rebroadcast,
//! typing-expiry wakeups) lives in one [`Timers`] arena. Components keep the
//! [`TimerId`] they were handed and cancel it explicitly; the driver asks
//! for [`Timers::next_deadline`], sleeps until then, and feeds the fired
//! entries back in. Clearing the arena on teardown guarantees that no
//! timer fires against a disposed conversation.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use convo_sync_types::ClientTempId;

/// Handle to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Channel ack window for one optimistic send.
    SendTimeout(ClientTempId),
    /// Re-broadcast (or idle-expire) the local typing state.
    TypingRebroadcast,
    /// Wake up when the earliest peer typing entry expires.
    TypingExpiry,
}

#[derive(Debug, Clone)]
struct Entry {
    deadline: Instant,
    kind: TimerKind,
}

/// Arena of armed timers, ordered by deadline.
#[derive(Debug, Default)]
pub struct Timers {
    next_id: u64,
    entries: BTreeMap<TimerId, Entry>,
}

impl Timers {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer firing `delay` after `now`.
    pub fn arm(&mut self, kind: TimerKind, now: Instant, delay: Duration) -> TimerId {
        self.arm_at(kind, now + delay)
    }

    /// Arm a timer firing at `deadline`.
    pub fn arm_at(&mut self, kind: TimerKind, deadline: Instant) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.insert(id, Entry { deadline, kind });
        id
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Check whether a timer is still armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Earliest deadline among armed timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first (ties in arming order).
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let mut fired: Vec<(Instant, TimerId, TimerKind)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, e)| (e.deadline, *id, e.kind))
            .collect();
        fired.sort_by_key(|(deadline, id, _)| (*deadline, *id));

        for (_, id, _) in &fired {
            self.entries.remove(id);
        }
        fired.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no timers are armed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancel everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
