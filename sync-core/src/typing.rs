//! Typing indicators, both directions.
//!
//! Peers: each `typing(true)` refreshes an expiry `now + ttl`; reads prune
//! expired entries first, so a peer that stops sending refreshes disappears
//! without an explicit `false`.
//!
//! Local user: only state changes are broadcast. While typing, the state
//! is re-broadcast every `rebroadcast` so peers' TTLs do not lapse, and if
//! no input arrives for `idle` the coordinator stops typing on its own.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use convo_sync_types::UserId;

use crate::timers::{TimerId, TimerKind, Timers};

/// Timing knobs for [`TypingCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingConfig {
    /// How long a peer's `typing(true)` stays valid.
    pub ttl: Duration,
    /// How often the local typing state is re-sent while typing.
    pub rebroadcast: Duration,
    /// Local inactivity after which typing stops by itself.
    pub idle: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3),
            rebroadcast: Duration::from_secs(3),
            idle: Duration::from_secs(5),
        }
    }
}

/// Typing state of one conversation.
#[derive(Debug)]
pub struct TypingCoordinator {
    config: TypingConfig,
    /// Peer → expiry.
    peers: HashMap<UserId, Instant>,
    expiry_timer: Option<TimerId>,

    local_typing: bool,
    last_input: Option<Instant>,
    last_broadcast: Option<Instant>,
    rebroadcast_timer: Option<TimerId>,
}

impl TypingCoordinator {
    /// Create an idle coordinator.
    pub fn new(config: TypingConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            expiry_timer: None,
            local_typing: false,
            last_input: None,
            last_broadcast: None,
            rebroadcast_timer: None,
        }
    }

    /// A peer started or stopped typing. Returns true if the visible set
    /// changed.
    pub fn peer_typing(
        &mut self,
        user: UserId,
        is_typing: bool,
        now: Instant,
        timers: &mut Timers,
    ) -> bool {
        let changed = if is_typing {
            self.peers.insert(user, now + self.config.ttl).is_none()
        } else {
            self.peers.remove(&user).is_some()
        };
        self.schedule_expiry(timers);
        changed
    }

    /// Peers currently typing, in id order, after pruning expired entries.
    pub fn typing_peers(&mut self, now: Instant) -> Vec<UserId> {
        self.prune(now);
        let mut peers: Vec<UserId> = self.peers.keys().copied().collect();
        peers.sort();
        peers
    }

    /// The expiry wakeup fired. Returns true if anyone stopped typing.
    pub fn on_expiry_timer(&mut self, now: Instant, timers: &mut Timers) -> bool {
        self.expiry_timer = None;
        let removed = self.prune(now);
        self.schedule_expiry(timers);
        removed > 0
    }

    /// The local user's typing state changed.
    ///
    /// Returns the state to broadcast, or `None` if nothing should be sent.
    pub fn local_typing_changed(
        &mut self,
        is_typing: bool,
        now: Instant,
        timers: &mut Timers,
    ) -> Option<bool> {
        match (self.local_typing, is_typing) {
            (false, true) => {
                self.local_typing = true;
                self.last_input = Some(now);
                self.last_broadcast = Some(now);
                self.schedule_rebroadcast(timers);
                Some(true)
            }
            (true, true) => {
                self.last_input = Some(now);
                None
            }
            (true, false) => {
                self.stop_local(timers);
                Some(false)
            }
            (false, false) => None,
        }
    }

    /// The rebroadcast timer fired.
    ///
    /// Returns `Some(true)` to refresh peers, `Some(false)` if the local
    /// user went idle, or `None` if nothing is due.
    pub fn on_rebroadcast_timer(&mut self, now: Instant, timers: &mut Timers) -> Option<bool> {
        self.rebroadcast_timer = None;
        if !self.local_typing {
            return None;
        }
        let last_input = self.last_input.unwrap_or(now);
        if now >= last_input + self.config.idle {
            tracing::debug!("local typing went idle");
            self.stop_local(timers);
            return Some(false);
        }
        let last_broadcast = self.last_broadcast.unwrap_or(now);
        let due = now >= last_broadcast + self.config.rebroadcast;
        if due {
            self.last_broadcast = Some(now);
        }
        self.schedule_rebroadcast(timers);
        due.then_some(true)
    }

    /// Whether the local user is currently considered typing.
    pub fn is_local_typing(&self) -> bool {
        self.local_typing
    }

    /// Forget everything and cancel owned timers.
    pub fn clear(&mut self, timers: &mut Timers) {
        self.peers.clear();
        if let Some(id) = self.expiry_timer.take() {
            timers.cancel(id);
        }
        if let Some(id) = self.rebroadcast_timer.take() {
            timers.cancel(id);
        }
        self.local_typing = false;
        self.last_input = None;
        self.last_broadcast = None;
    }

    fn stop_local(&mut self, timers: &mut Timers) {
        self.local_typing = false;
        self.last_input = None;
        self.last_broadcast = None;
        if let Some(id) = self.rebroadcast_timer.take() {
            timers.cancel(id);
        }
    }

    fn prune(&mut self, now: Instant) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, expires| *expires > now);
        before - self.peers.len()
    }

    fn schedule_expiry(&mut self, timers: &mut Timers) {
        if let Some(id) = self.expiry_timer.take() {
            timers.cancel(id);
        }
        if let Some(earliest) = self.peers.values().min() {
            self.expiry_timer = Some(timers.arm_at(TimerKind::TypingExpiry, *earliest));
        }
    }

    fn schedule_rebroadcast(&mut self, timers: &mut Timers) {
        if let Some(id) = self.rebroadcast_timer.take() {
            timers.cancel(id);
        }
        let (Some(last_broadcast), Some(last_input)) = (self.last_broadcast, self.last_input)
        else {
            return;
        };
        let deadline = (last_broadcast + self.config.rebroadcast).min(last_input + self.config.idle);
        self.rebroadcast_timer = Some(timers.arm_at(TimerKind::TypingRebroadcast, deadline));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn coordinator() -> (TypingCoordinator, Timers, Instant) {
        (
            TypingCoordinator::new(TypingConfig::default()),
            Timers::new(),
            Instant::now(),
        )
    }

    /// Fire due timers the way the engine does, collecting broadcasts.
    fn advance(typing: &mut TypingCoordinator, timers: &mut Timers, at: Instant) -> Vec<bool> {
        let mut sent = Vec::new();
        for (_, kind) in timers.pop_expired(at) {
            match kind {
                TimerKind::TypingRebroadcast => sent.extend(typing.on_rebroadcast_timer(at, timers)),
                TimerKind::TypingExpiry => {
                    typing.on_expiry_timer(at, timers);
                }
                TimerKind::SendTimeout(_) => {}
            }
        }
        sent
    }

    #[test]
    fn peer_expires_without_stop_event() {
        let (mut typing, mut timers, t0) = coordinator();
        typing.peer_typing(UserId::new(2), true, t0, &mut timers);

        assert_eq!(typing.typing_peers(t0 + Duration::from_millis(2999)), vec![UserId::new(2)]);
        assert!(typing.typing_peers(t0 + secs(3)).is_empty());
    }

    #[test]
    fn refresh_extends_expiry() {
        let (mut typing, mut timers, t0) = coordinator();
        typing.peer_typing(UserId::new(2), true, t0, &mut timers);
        typing.peer_typing(UserId::new(2), true, t0 + secs(2), &mut timers);

        assert_eq!(typing.typing_peers(t0 + secs(4)), vec![UserId::new(2)]);
        assert!(typing.typing_peers(t0 + secs(5)).is_empty());
    }

    #[test]
    fn stop_removes_immediately() {
        let (mut typing, mut timers, t0) = coordinator();
        typing.peer_typing(UserId::new(2), true, t0, &mut timers);
        assert!(typing.peer_typing(UserId::new(2), false, t0, &mut timers));
        assert!(typing.typing_peers(t0).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn expiry_timer_tracks_earliest_peer() {
        let (mut typing, mut timers, t0) = coordinator();
        typing.peer_typing(UserId::new(2), true, t0, &mut timers);
        typing.peer_typing(UserId::new(3), true, t0 + secs(1), &mut timers);
        assert_eq!(timers.next_deadline(), Some(t0 + secs(3)));

        for (_, kind) in timers.pop_expired(t0 + secs(3)) {
            assert_eq!(kind, TimerKind::TypingExpiry);
            assert!(typing.on_expiry_timer(t0 + secs(3), &mut timers));
        }
        assert_eq!(typing.typing_peers(t0 + secs(3)), vec![UserId::new(3)]);
        assert_eq!(timers.next_deadline(), Some(t0 + secs(4)));
    }

    #[test]
    fn local_broadcasts_only_on_change() {
        let (mut typing, mut timers, t0) = coordinator();

        assert_eq!(typing.local_typing_changed(true, t0, &mut timers), Some(true));
        assert_eq!(typing.local_typing_changed(true, t0 + secs(1), &mut timers), None);
        assert_eq!(typing.local_typing_changed(false, t0 + secs(2), &mut timers), Some(false));
        assert_eq!(typing.local_typing_changed(false, t0 + secs(2), &mut timers), None);
        assert!(timers.is_empty());
    }

    #[test]
    fn local_rebroadcasts_while_active() {
        let (mut typing, mut timers, t0) = coordinator();
        typing.local_typing_changed(true, t0, &mut timers);

        // Keep typing every second
        let mut sent = Vec::new();
        for s in 1..=4 {
            typing.local_typing_changed(true, t0 + secs(s), &mut timers);
            sent.extend(advance(&mut typing, &mut timers, t0 + secs(s)));
        }
        assert_eq!(sent, vec![true]);
        assert!(typing.is_local_typing());
    }

    #[test]
    fn local_goes_idle() {
        let (mut typing, mut timers, t0) = coordinator();
        typing.local_typing_changed(true, t0, &mut timers);

        let mut sent = Vec::new();
        sent.extend(advance(&mut typing, &mut timers, t0 + secs(3)));
        sent.extend(advance(&mut typing, &mut timers, t0 + secs(5)));

        assert_eq!(sent, vec![true, false]);
        assert!(!typing.is_local_typing());
        assert!(timers.is_empty());
    }

    #[test]
    fn clear_cancels_timers() {
        let (mut typing, mut timers, t0) = coordinator();
        typing.peer_typing(UserId::new(2), true, t0, &mut timers);
        typing.local_typing_changed(true, t0, &mut timers);

        typing.clear(&mut timers);

        assert!(timers.is_empty());
        assert!(typing.typing_peers(t0).is_empty());
        assert!(!typing.is_local_typing());
    }
}
