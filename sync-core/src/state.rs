//! Engine lifecycle state machine for convo-sync.
//!
//! This module provides a pure, side-effect-free state machine for the
//! lifecycle of one conversation engine. The state machine takes events as
//! input and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (joining the channel, flushing commands) is performed by
//! sync-client, not by this module.

use serde::Serialize;

/// Engine lifecycle - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Subscribing to the channel and loading the first history page.
    Connecting {
        /// Channel subscription is established.
        joined: bool,
        /// The first history fetch finished (successfully or not).
        history_settled: bool,
    },
    /// Normal operation.
    Ready,
    /// Channel lost; waiting for the channel collaborator to restore it.
    Reconnecting,
    /// Terminal.
    Closed,
}

impl EngineState {
    /// Initial state.
    pub fn new() -> Self {
        Self::Connecting {
            joined: false,
            history_settled: false,
        }
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // Closed is terminal
            (Self::Closed, _) => (Self::Closed, vec![]),
            (_, Event::CloseRequested) => (Self::Closed, vec![Action::Teardown]),

            // From Connecting
            (Self::Connecting { history_settled, .. }, Event::Joined) => {
                let mut actions = vec![Action::RequestPresenceSnapshot];
                if history_settled {
                    actions.push(Action::FlushQueue);
                    (Self::Ready, actions)
                } else {
                    (
                        Self::Connecting {
                            joined: true,
                            history_settled,
                        },
                        actions,
                    )
                }
            }
            (Self::Connecting { joined, .. }, Event::InitialPageSettled) => {
                if joined {
                    (Self::Ready, vec![Action::FlushQueue])
                } else {
                    (
                        Self::Connecting {
                            joined,
                            history_settled: true,
                        },
                        vec![],
                    )
                }
            }
            (Self::Connecting { history_settled, .. }, Event::ChannelLost) => (
                Self::Connecting {
                    joined: false,
                    history_settled,
                },
                vec![Action::InvalidatePresence],
            ),

            // From Ready
            (Self::Ready, Event::ChannelLost) => {
                (Self::Reconnecting, vec![Action::InvalidatePresence])
            }

            // From Reconnecting
            (Self::Reconnecting, Event::ChannelRestored | Event::Joined) => (
                Self::Ready,
                vec![Action::RequestPresenceSnapshot, Action::FlushQueue],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if commands can be sent directly.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the engine has shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Short lowercase name for logs and snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Events that can occur in the engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The channel subscription for this conversation is established.
    Joined,
    /// The first history fetch finished, successfully or not.
    InitialPageSettled,
    /// The channel reported a disconnect.
    ChannelLost,
    /// The channel collaborator re-established the connection.
    ChannelRestored,
    /// The owner asked the engine to shut down.
    CloseRequested,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Transmit everything queued while not ready.
    FlushQueue,
    /// Ask the channel for the current online set.
    RequestPresenceSnapshot,
    /// Treat presence as unknown until the next snapshot.
    InvalidatePresence,
    /// Release the channel, invalidate pagination, cancel timers.
    Teardown,
}
