//! Per-user read receipts.
//!
//! Message ids are assigned by the server in send order, so a receipt
//! for id `n` covers every message with id `<= n`. Receipts only move
//! forward; an older or duplicate receipt is ignored.

use std::collections::BTreeMap;

use convo_sync_types::{MessageId, Timestamp, UserId};
use serde::Serialize;

use crate::store::MessageStore;

/// Highest message a user has read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadReceipt {
    /// Newest message read.
    pub message_id: MessageId,
    /// When the receipt was issued.
    pub read_at: Timestamp,
}

/// Tracks the newest read message per user.
#[derive(Debug, Default, Clone)]
pub struct ReadReceiptTracker {
    receipts: BTreeMap<UserId, ReadReceipt>,
}

impl ReadReceiptTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user` read up to `message_id`.
    ///
    /// Returns false (and changes nothing) unless the receipt is newer than
    /// the one on record.
    pub fn advance(&mut self, user: UserId, message_id: MessageId, read_at: Timestamp) -> bool {
        match self.receipts.get(&user) {
            Some(current) if current.message_id >= message_id => false,
            _ => {
                self.receipts.insert(
                    user,
                    ReadReceipt {
                        message_id,
                        read_at,
                    },
                );
                true
            }
        }
    }

    /// Current receipt for `user`.
    pub fn receipt_for(&self, user: UserId) -> Option<ReadReceipt> {
        self.receipts.get(&user).copied()
    }

    /// Confirmed messages newer than `local`'s receipt and not sent by them.
    pub fn unread_count_for(&self, local: UserId, store: &MessageStore) -> usize {
        let floor = self.receipt_for(local).map(|r| r.message_id);
        store
            .confirmed()
            .filter(|m| m.sender_id != local)
            .filter(|m| match (m.id, floor) {
                (Some(id), Some(floor)) => id > floor,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .count()
    }

    /// Users whose receipt covers `message_id`.
    pub fn readers_of(&self, message_id: MessageId) -> Vec<UserId> {
        self.receipts
            .iter()
            .filter(|(_, r)| r.message_id >= message_id)
            .map(|(user, _)| *user)
            .collect()
    }

    /// Whether marking `newest` as read would move `local`'s receipt forward.
    pub fn should_mark_read(&self, local: UserId, newest: MessageId) -> bool {
        self.receipt_for(local)
            .map_or(true, |r| newest > r.message_id)
    }

    /// Every receipt, keyed by user.
    pub fn all(&self) -> &BTreeMap<UserId, ReadReceipt> {
        &self.receipts
    }

    /// Drop every receipt.
    pub fn clear(&mut self) {
        self.receipts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_sync_types::{ConversationId, Message};
    use proptest::prelude::*;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn store(messages: &[(u64, u64)]) -> MessageStore {
        let mut store = MessageStore::new();
        for (id, sender) in messages {
            store.append(Message::confirmed(
                MessageId::new(*id),
                ConversationId::new(1),
                UserId::new(*sender),
                "x",
                ts(*id as i64),
            ));
        }
        store
    }

    #[test]
    fn receipts_only_advance() {
        let mut receipts = ReadReceiptTracker::new();
        let u = UserId::new(2);

        assert!(receipts.advance(u, MessageId::new(5), ts(50)));
        assert!(!receipts.advance(u, MessageId::new(3), ts(60)));
        assert!(!receipts.advance(u, MessageId::new(5), ts(70)));
        assert_eq!(receipts.receipt_for(u).unwrap().message_id, MessageId::new(5));
        assert_eq!(receipts.receipt_for(u).unwrap().read_at, ts(50));
    }

    #[test]
    fn unread_excludes_own_messages() {
        let store = store(&[(1, 2), (2, 1), (3, 2), (4, 2)]);
        let mut receipts = ReadReceiptTracker::new();
        let me = UserId::new(1);

        assert_eq!(receipts.unread_count_for(me, &store), 3);
        receipts.advance(me, MessageId::new(3), ts(0));
        assert_eq!(receipts.unread_count_for(me, &store), 1);
    }

    #[test]
    fn readers_of_covers_older_messages() {
        let mut receipts = ReadReceiptTracker::new();
        receipts.advance(UserId::new(2), MessageId::new(5), ts(0));
        receipts.advance(UserId::new(3), MessageId::new(2), ts(0));

        assert_eq!(receipts.readers_of(MessageId::new(2)), vec![UserId::new(2), UserId::new(3)]);
        assert_eq!(receipts.readers_of(MessageId::new(4)), vec![UserId::new(2)]);
        assert!(receipts.readers_of(MessageId::new(6)).is_empty());
    }

    #[test]
    fn should_mark_read_only_forward() {
        let mut receipts = ReadReceiptTracker::new();
        let me = UserId::new(1);
        assert!(receipts.should_mark_read(me, MessageId::new(1)));

        receipts.advance(me, MessageId::new(4), ts(0));
        assert!(!receipts.should_mark_read(me, MessageId::new(4)));
        assert!(!receipts.should_mark_read(me, MessageId::new(2)));
        assert!(receipts.should_mark_read(me, MessageId::new(5)));
    }

    proptest! {
        #[test]
        fn stored_receipt_never_decreases(ids in prop::collection::vec(0u64..1000, 1..50)) {
            let mut receipts = ReadReceiptTracker::new();
            let u = UserId::new(7);
            let mut high = 0;
            for id in ids {
                receipts.advance(u, MessageId::new(id), ts(0));
                let stored = receipts.receipt_for(u).unwrap().message_id.value();
                prop_assert!(stored >= high);
                high = stored;
            }
        }
    }
}
