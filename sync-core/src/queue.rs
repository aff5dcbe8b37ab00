//! Commands held back while the engine is not ready.
//!
//! Sends are tracked by temp id only (their payload lives in the send
//! tracker) and are never evicted. Other commands are bounded; when full,
//! the oldest command is dropped. Only the latest typing state is kept.

use std::collections::VecDeque;

use convo_sync_types::{ClientTempId, OutboundCommand};

/// One held-back item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Queued {
    /// An optimistic send awaiting transmission.
    Send(ClientTempId),
    /// Any other channel command.
    Command(OutboundCommand),
}

/// FIFO of held-back commands.
#[derive(Debug)]
pub struct CommandQueue {
    items: VecDeque<Queued>,
    limit: usize,
    commands: usize,
}

impl CommandQueue {
    /// Create a queue holding at most `limit` non-send commands.
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
            commands: 0,
        }
    }

    /// Hold back a send until the channel is ready.
    pub fn defer_send(&mut self, temp: ClientTempId) {
        if !self.items.contains(&Queued::Send(temp)) {
            self.items.push_back(Queued::Send(temp));
        }
    }

    /// Hold back a command. Returns the command evicted to make room, if any.
    pub fn push(&mut self, command: OutboundCommand) -> Option<OutboundCommand> {
        if matches!(command, OutboundCommand::SetTyping { .. }) {
            self.remove_where(|c| matches!(c, OutboundCommand::SetTyping { .. }));
        }

        let mut evicted = None;
        if self.commands >= self.limit {
            evicted = self.evict_oldest();
            if let Some(cmd) = &evicted {
                tracing::warn!(command = cmd.name(), "command queue full, dropping oldest");
            }
        }
        if self.limit == 0 {
            return Some(command);
        }
        self.items.push_back(Queued::Command(command));
        self.commands += 1;
        evicted
    }

    /// Take everything, in the order it was queued.
    pub fn drain(&mut self) -> Vec<Queued> {
        self.commands = 0;
        self.items.drain(..).collect()
    }

    /// Forget a deferred send (confirmed, failed, or discarded meanwhile).
    pub fn cancel_send(&mut self, temp: &ClientTempId) {
        self.items.retain(|q| !matches!(q, Queued::Send(t) if t == temp));
    }

    /// Number of held-back items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if nothing is held back.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.items.clear();
        self.commands = 0;
    }

    fn remove_where(&mut self, pred: impl Fn(&OutboundCommand) -> bool) {
        let before = self.items.len();
        self.items
            .retain(|q| !matches!(q, Queued::Command(c) if pred(c)));
        self.commands -= before - self.items.len();
    }

    fn evict_oldest(&mut self) -> Option<OutboundCommand> {
        let idx = self
            .items
            .iter()
            .position(|q| matches!(q, Queued::Command(_)))?;
        match self.items.remove(idx)? {
            Queued::Command(cmd) => {
                self.commands -= 1;
                Some(cmd)
            }
            Queued::Send(_) => None,
        }
    }
}
