//! Message store for one conversation.
//!
//! This module provides the ordered, deduplicated message list that the
//! renderer displays:
//! - Confirmed messages sorted by `(created_at, id)`
//! - Pending (optimistic) messages as a tail in send order
//! - Reconciliation of a pending record with its server echo
//!
//! Delivery is at-least-once, so every mutation here is idempotent:
//! inserting an id that is already present is a no-op, not an error.

use std::collections::{HashMap, HashSet};

use convo_sync_types::{ClientTempId, Message, MessageId, MessageRef, Reactions, UserId};

/// Result of [`MessageStore::upsert_by_temp_or_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A pending record with the same client temp id was replaced.
    Reconciled,
    /// A message with the same id was already present; nothing changed.
    Duplicate,
    /// The message was new and inserted in sorted position.
    Inserted,
    /// The message has no id and no matching pending record.
    Rejected,
}

/// Add or remove a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOp {
    /// Add the reaction.
    Add,
    /// Remove the reaction.
    Remove,
}

/// Ordered, deduplicated messages for one conversation.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    /// Confirmed messages, sorted by `(created_at, id)`.
    confirmed: Vec<Message>,
    /// Ids present in `confirmed`.
    ids: HashSet<MessageId>,
    /// Pending messages in send order.
    pending: Vec<Message>,
    /// Where each pending temp id sits in `pending`.
    pending_index: HashMap<ClientTempId, usize>,
}

impl MessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a live message.
    ///
    /// Pending messages go to the tail; confirmed ones take the same path
    /// as [`Self::upsert_by_temp_or_id`].
    pub fn append(&mut self, msg: Message) -> UpsertOutcome {
        if msg.id.is_none() {
            let Some(temp) = msg.client_temp_id else {
                return UpsertOutcome::Rejected;
            };
            if self.pending_index.contains_key(&temp) {
                return UpsertOutcome::Duplicate;
            }
            self.pending_index.insert(temp, self.pending.len());
            self.pending.push(msg);
            return UpsertOutcome::Inserted;
        }
        self.upsert_by_temp_or_id(msg)
    }

    /// Merge an older page of confirmed messages under the current window.
    ///
    /// Pages are expected not to overlap what is loaded, but overlapping ids
    /// are skipped. Returns how many messages were actually inserted.
    pub fn prepend_page(&mut self, msgs: Vec<Message>) -> usize {
        let mut inserted = 0;
        for msg in msgs {
            let Some(id) = msg.id else {
                continue;
            };
            if self.ids.contains(&id) {
                tracing::debug!(message_id = %id, "skipping overlapping history message");
                continue;
            }
            self.insert_sorted(msg);
            inserted += 1;
        }
        inserted
    }

    /// Reconciliation primitive.
    ///
    /// - If `msg` carries a client temp id matching a pending record, that
    ///   record is replaced by the confirmed message.
    /// - Otherwise, if a message with the same id exists, nothing happens.
    /// - Otherwise the message is inserted in sorted position.
    pub fn upsert_by_temp_or_id(&mut self, msg: Message) -> UpsertOutcome {
        let Some(id) = msg.id else {
            return UpsertOutcome::Rejected;
        };

        if let Some(temp) = msg.client_temp_id {
            if let Some(pending) = self.take_pending(&temp) {
                if self.ids.contains(&id) {
                    // Fallback response raced the channel echo; keep the
                    // copy that landed first
                    tracing::debug!(client_temp_id = %temp, message_id = %id, "pending already confirmed under same id");
                } else {
                    let mut confirmed = msg;
                    // Reactions added optimistically before the ack survive
                    for (emoji, users) in pending.reactions.iter() {
                        for user in users {
                            confirmed.reactions.add(emoji, *user);
                        }
                    }
                    self.insert_sorted(confirmed);
                }
                return UpsertOutcome::Reconciled;
            }
        }

        if self.ids.contains(&id) {
            return UpsertOutcome::Duplicate;
        }
        self.insert_sorted(msg);
        UpsertOutcome::Inserted
    }

    /// Apply a reaction to a confirmed message.
    ///
    /// Returns `None` if the message is unknown, otherwise whether the
    /// reaction set changed.
    pub fn apply_reaction(
        &mut self,
        id: MessageId,
        emoji: &str,
        user: UserId,
        op: ReactionOp,
    ) -> Option<bool> {
        let msg = self.get_mut(id)?;
        Some(match op {
            ReactionOp::Add => msg.reactions.add(emoji, user),
            ReactionOp::Remove => msg.reactions.remove(emoji, user),
        })
    }

    /// Replace the full reaction map of a confirmed message.
    pub fn replace_reactions(&mut self, id: MessageId, reactions: Reactions) -> bool {
        match self.get_mut(id) {
            Some(msg) => {
                msg.reactions = reactions;
                true
            }
            None => false,
        }
    }

    /// Replace a message's content with a recall tombstone.
    ///
    /// Returns false if the message is unknown or already recalled.
    pub fn mark_recalled(&mut self, id: MessageId) -> bool {
        self.get_mut(id).is_some_and(Message::recall)
    }

    /// Pin or unpin a confirmed message.
    ///
    /// Returns false if the message is unknown or already in that state.
    pub fn set_pinned(&mut self, id: MessageId, pinned: bool) -> bool {
        self.get_mut(id).is_some_and(|msg| msg.set_pinned(pinned))
    }

    /// Ids of pinned messages, in display order.
    pub fn pinned_ids(&self) -> Vec<MessageId> {
        self.confirmed
            .iter()
            .filter(|msg| msg.is_pinned)
            .filter_map(|msg| msg.id)
            .collect()
    }

    /// Record that `user` has read message `id`.
    pub fn add_read_by(&mut self, id: MessageId, user: UserId) -> bool {
        self.get_mut(id).is_some_and(|msg| msg.read_by.insert(user))
    }

    /// Remove a confirmed message (server-side deletion).
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let idx = self.position(id)?;
        self.ids.remove(&id);
        Some(self.confirmed.remove(idx))
    }

    /// Remove a pending message (discard or save failure).
    pub fn remove_pending(&mut self, temp: &ClientTempId) -> Option<Message> {
        self.take_pending(temp)
    }

    /// Look up a confirmed message.
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).map(|idx| &self.confirmed[idx])
    }

    /// Look up a pending message.
    pub fn get_pending(&self, temp: &ClientTempId) -> Option<&Message> {
        self.pending_index.get(temp).map(|&idx| &self.pending[idx])
    }

    /// Mutable access to a pending message (optimistic reactions).
    pub fn get_pending_mut(&mut self, temp: &ClientTempId) -> Option<&mut Message> {
        let idx = *self.pending_index.get(temp)?;
        self.pending.get_mut(idx)
    }

    /// Check whether a confirmed message with this id exists.
    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    /// Check whether a pending record exists for this temp id.
    pub fn is_pending(&self, temp: &ClientTempId) -> bool {
        self.pending_index.contains_key(temp)
    }

    /// Ordered view: confirmed messages then pending ones.
    pub fn snapshot(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    /// Iterate in display order without cloning.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.confirmed.iter().chain(self.pending.iter())
    }

    /// Iterate confirmed messages in display order.
    pub fn confirmed(&self) -> impl Iterator<Item = &Message> {
        self.confirmed.iter()
    }

    /// Oldest loaded confirmed message (the pagination cursor).
    pub fn oldest_ref(&self) -> Option<MessageRef> {
        self.confirmed.first().and_then(Message::message_ref)
    }

    /// Newest confirmed message.
    pub fn newest_ref(&self) -> Option<MessageRef> {
        self.confirmed.last().and_then(Message::message_ref)
    }

    /// Highest confirmed id not authored by `user`.
    pub fn newest_from_others(&self, user: UserId) -> Option<MessageId> {
        self.confirmed
            .iter()
            .filter(|m| m.sender_id != user)
            .filter_map(|m| m.id)
            .max()
    }

    /// Number of confirmed messages.
    pub fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }

    /// Number of pending messages.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Total number of messages.
    pub fn len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.pending.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.ids.clear();
        self.pending.clear();
        self.pending_index.clear();
    }

    fn sort_key(msg: &Message) -> (i64, u64) {
        (
            msg.created_at.as_millis(),
            msg.id.map(|id| id.value()).unwrap_or(u64::MAX),
        )
    }

    fn insert_sorted(&mut self, msg: Message) {
        let key = Self::sort_key(&msg);
        let idx = self
            .confirmed
            .partition_point(|existing| Self::sort_key(existing) <= key);
        if let Some(id) = msg.id {
            self.ids.insert(id);
        }
        self.confirmed.insert(idx, msg);
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        if !self.ids.contains(&id) {
            return None;
        }
        // Live appends land at the tail, so search from the back
        self.confirmed.iter().rposition(|m| m.id == Some(id))
    }

    fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let idx = self.position(id)?;
        self.confirmed.get_mut(idx)
    }

    fn take_pending(&mut self, temp: &ClientTempId) -> Option<Message> {
        let idx = self.pending_index.remove(temp)?;
        let msg = self.pending.remove(idx);
        for slot in self.pending_index.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(msg)
    }
}
