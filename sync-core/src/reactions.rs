//! Reaction bookkeeping on top of [`MessageStore`].
//!
//! Reaction events can outrun the message they refer to (a history page
//! still in flight, or a broadcast delivered out of order). Those are parked
//! here, bounded, and replayed when the message shows up.

use std::collections::VecDeque;

use convo_sync_types::{MessageId, Reactions, UserId};

use crate::store::{MessageStore, ReactionOp};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Parked {
    Delta {
        emoji: String,
        user: UserId,
        op: ReactionOp,
    },
    Replace(Reactions),
}

/// Applies reaction events and the local user's toggles.
#[derive(Debug)]
pub struct ReactionLedger {
    parked: VecDeque<(MessageId, Parked)>,
    limit: usize,
}

impl ReactionLedger {
    /// Create a ledger parking at most `limit` early reactions.
    pub fn new(limit: usize) -> Self {
        Self {
            parked: VecDeque::new(),
            limit,
        }
    }

    /// Add a reaction. Idempotent per (message, user, emoji).
    pub fn add_reaction(
        &mut self,
        store: &mut MessageStore,
        id: MessageId,
        user: UserId,
        emoji: &str,
    ) -> bool {
        self.apply(store, id, user, emoji, ReactionOp::Add)
    }

    /// Remove a reaction. Idempotent per (message, user, emoji).
    pub fn remove_reaction(
        &mut self,
        store: &mut MessageStore,
        id: MessageId,
        user: UserId,
        emoji: &str,
    ) -> bool {
        self.apply(store, id, user, emoji, ReactionOp::Remove)
    }

    /// Replace a message's reactions with the server's full map.
    pub fn replace(&mut self, store: &mut MessageStore, id: MessageId, reactions: Reactions) -> bool {
        if store.contains(id) {
            // Earlier parked deltas are subsumed by the full map
            self.forget(id);
            return store.replace_reactions(id, reactions);
        }
        self.park(id, Parked::Replace(reactions));
        false
    }

    /// Replay anything parked for a message that just entered the store.
    /// Returns true if the message's reactions changed.
    pub fn on_message_inserted(&mut self, store: &mut MessageStore, id: MessageId) -> bool {
        if !store.contains(id) || !self.parked.iter().any(|(m, _)| *m == id) {
            return false;
        }
        let mut changed = false;
        let mut rest = VecDeque::with_capacity(self.parked.len());
        for (message_id, parked) in self.parked.drain(..) {
            if message_id != id {
                rest.push_back((message_id, parked));
                continue;
            }
            changed |= match parked {
                Parked::Delta { emoji, user, op } => {
                    store.apply_reaction(id, &emoji, user, op).unwrap_or(false)
                }
                Parked::Replace(reactions) => store.replace_reactions(id, reactions),
            };
        }
        self.parked = rest;
        tracing::debug!(message_id = %id, changed, "replayed parked reactions");
        changed
    }

    /// Flip the local user's `emoji` on a message, applying it
    /// optimistically.
    ///
    /// Returns whether the reaction was added (`true`) or removed, or
    /// `None` if the message is not loaded.
    pub fn toggle(
        &mut self,
        store: &mut MessageStore,
        id: MessageId,
        local: UserId,
        emoji: &str,
    ) -> Option<bool> {
        let add = !store.get(id)?.reactions.contains(emoji, local);
        let op = if add { ReactionOp::Add } else { ReactionOp::Remove };
        store.apply_reaction(id, emoji, local, op)?;
        Some(add)
    }

    /// Drop anything parked for a message (it was deleted).
    pub fn forget(&mut self, id: MessageId) {
        self.parked.retain(|(m, _)| *m != id);
    }

    /// Number of parked reactions.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Drop everything parked.
    pub fn clear(&mut self) {
        self.parked.clear();
    }

    fn apply(
        &mut self,
        store: &mut MessageStore,
        id: MessageId,
        user: UserId,
        emoji: &str,
        op: ReactionOp,
    ) -> bool {
        match store.apply_reaction(id, emoji, user, op) {
            Some(changed) => changed,
            None => {
                self.park(
                    id,
                    Parked::Delta {
                        emoji: emoji.to_string(),
                        user,
                        op,
                    },
                );
                false
            }
        }
    }

    fn park(&mut self, id: MessageId, parked: Parked) {
        if self.limit == 0 {
            return;
        }
        while self.parked.len() >= self.limit {
            if let Some((dropped, _)) = self.parked.pop_front() {
                tracing::debug!(message_id = %dropped, "parked reaction evicted");
            }
        }
        self.parked.push_back((id, parked));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_sync_types::{ConversationId, Message, Timestamp};

    fn store_with(ids: &[u64]) -> MessageStore {
        let mut store = MessageStore::new();
        for id in ids {
            store.append(Message::confirmed(
                MessageId::new(*id),
                ConversationId::new(1),
                UserId::new(2),
                "x",
                Timestamp::from_millis(*id as i64),
            ));
        }
        store
    }

    fn reactions_of(store: &MessageStore, id: u64) -> Reactions {
        store.get(MessageId::new(id)).unwrap().reactions.clone()
    }

    #[test]
    fn add_is_idempotent() {
        let mut store = store_with(&[1]);
        let mut ledger = ReactionLedger::new(8);

        assert!(ledger.add_reaction(&mut store, MessageId::new(1), UserId::new(3), "👍"));
        assert!(!ledger.add_reaction(&mut store, MessageId::new(1), UserId::new(3), "👍"));
        assert_eq!(reactions_of(&store, 1).total(), 1);

        assert!(ledger.remove_reaction(&mut store, MessageId::new(1), UserId::new(3), "👍"));
        assert!(!ledger.remove_reaction(&mut store, MessageId::new(1), UserId::new(3), "👍"));
        assert!(reactions_of(&store, 1).is_empty());
    }

    #[test]
    fn early_reaction_is_parked_and_replayed() {
        let mut store = store_with(&[]);
        let mut ledger = ReactionLedger::new(8);

        ledger.add_reaction(&mut store, MessageId::new(5), UserId::new(3), "🔥");
        assert_eq!(ledger.parked_len(), 1);

        store.append(Message::confirmed(
            MessageId::new(5),
            ConversationId::new(1),
            UserId::new(2),
            "late",
            Timestamp::from_millis(5),
        ));
        assert!(ledger.on_message_inserted(&mut store, MessageId::new(5)));
        assert!(reactions_of(&store, 5).contains("🔥", UserId::new(3)));
        assert_eq!(ledger.parked_len(), 0);
    }

    #[test]
    fn replace_overrides_parked_deltas() {
        let mut store = store_with(&[1]);
        let mut ledger = ReactionLedger::new(8);
        ledger.add_reaction(&mut store, MessageId::new(1), UserId::new(3), "👍");

        let full: Reactions = vec![("❤️".to_string(), UserId::new(4))].into_iter().collect();
        assert!(ledger.replace(&mut store, MessageId::new(1), full.clone()));
        assert_eq!(reactions_of(&store, 1), full);
    }

    #[test]
    fn parking_is_bounded() {
        let mut store = store_with(&[]);
        let mut ledger = ReactionLedger::new(2);
        for id in 10..15 {
            ledger.add_reaction(&mut store, MessageId::new(id), UserId::new(3), "👍");
        }
        assert_eq!(ledger.parked_len(), 2);

        ledger.forget(MessageId::new(14));
        assert_eq!(ledger.parked_len(), 1);
    }

    #[test]
    fn toggle_flips_local_reaction() {
        let mut store = store_with(&[1]);
        let mut ledger = ReactionLedger::new(8);
        let me = UserId::new(1);

        assert_eq!(ledger.toggle(&mut store, MessageId::new(1), me, "👍"), Some(true));
        assert!(reactions_of(&store, 1).contains("👍", me));
        assert_eq!(ledger.toggle(&mut store, MessageId::new(1), me, "👍"), Some(false));
        assert!(reactions_of(&store, 1).is_empty());
        assert_eq!(ledger.toggle(&mut store, MessageId::new(9), me, "👍"), None);
    }
}
