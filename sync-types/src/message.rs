//! Conversation data model: messages, reactions, conversations.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::{ClientTempId, ConversationId, MessageId, Timestamp, UserId};

/// Kind of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image attachment.
    Image,
    /// Video attachment.
    Video,
    /// Any other file attachment.
    File,
}

impl MessageKind {
    /// Parse a server-side message type name, case-insensitively.
    ///
    /// Unknown names map to `None`; callers decide the fallback.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "image" | "photo" => Some(Self::Image),
            "video" => Some(Self::Video),
            "file" | "document" => Some(Self::File),
            _ => None,
        }
    }
}

/// Emoji reactions on one message: emoji → users who reacted with it.
///
/// Empty buckets are never stored, so two `Reactions` with the same
/// visible content compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<String, BTreeSet<UserId>>);

impl Reactions {
    /// Create an empty reaction map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `user` reacting with `emoji`. Returns false if already present.
    pub fn add(&mut self, emoji: &str, user: UserId) -> bool {
        self.0.entry(emoji.to_string()).or_default().insert(user)
    }

    /// Remove `user`'s `emoji` reaction. Returns false if it was not present.
    pub fn remove(&mut self, emoji: &str, user: UserId) -> bool {
        let Some(users) = self.0.get_mut(emoji) else {
            return false;
        };
        let removed = users.remove(&user);
        if users.is_empty() {
            self.0.remove(emoji);
        }
        removed
    }

    /// Check whether `user` reacted with `emoji`.
    pub fn contains(&self, emoji: &str, user: UserId) -> bool {
        self.0.get(emoji).is_some_and(|users| users.contains(&user))
    }

    /// Users who reacted with `emoji`.
    pub fn users(&self, emoji: &str) -> impl Iterator<Item = &UserId> {
        self.0.get(emoji).into_iter().flatten()
    }

    /// Iterate emoji buckets in emoji order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<UserId>)> {
        self.0.iter()
    }

    /// Total number of (emoji, user) pairs.
    pub fn total(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    /// Check if there are no reactions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, UserId)> for Reactions {
    fn from_iter<I: IntoIterator<Item = (String, UserId)>>(iter: I) -> Self {
        let mut reactions = Reactions::new();
        for (emoji, user) in iter {
            reactions.add(&emoji, user);
        }
        reactions
    }
}

/// A chat message, either pending (no server id yet) or confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server id; `None` while the message is pending.
    pub id: Option<MessageId>,
    /// Correlation id of the optimistic send, if this message originated
    /// from one (also present on the server echo).
    pub client_temp_id: Option<ClientTempId>,
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Content kind.
    pub kind: MessageKind,
    /// Text content (caption for media); empty once recalled.
    pub content: String,
    /// Media location for non-text kinds.
    pub media_url: Option<String>,
    /// Creation time (server time once confirmed, local time while pending).
    pub created_at: Timestamp,
    /// Message this one replies to.
    pub reply_to_id: Option<MessageId>,
    /// Whether the author retracted the message.
    pub is_recalled: bool,
    /// Whether the message is pinned in the conversation.
    #[serde(default)]
    pub is_pinned: bool,
    /// Emoji reactions.
    pub reactions: Reactions,
    /// Users known to have read this message.
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    /// Build the optimistic local record for an outgoing payload.
    pub fn pending(
        client_temp_id: ClientTempId,
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: &OutgoingPayload,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: None,
            client_temp_id: Some(client_temp_id),
            conversation_id,
            sender_id,
            kind: payload.kind,
            content: payload.content.clone(),
            media_url: payload.media_url.clone(),
            created_at,
            reply_to_id: payload.reply_to,
            is_recalled: false,
            is_pinned: false,
            reactions: Reactions::new(),
            read_by: BTreeSet::new(),
        }
    }

    /// Build a confirmed text message (convenience for history and tests).
    pub fn confirmed(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: Some(id),
            client_temp_id: None,
            conversation_id,
            sender_id,
            kind: MessageKind::Text,
            content: content.to_string(),
            media_url: None,
            created_at,
            reply_to_id: None,
            is_recalled: false,
            is_pinned: false,
            reactions: Reactions::new(),
            read_by: BTreeSet::new(),
        }
    }

    /// Attach the correlation id of the send this message confirms.
    pub fn with_client_temp_id(mut self, client_temp_id: ClientTempId) -> Self {
        self.client_temp_id = Some(client_temp_id);
        self
    }

    /// Check if the message is still awaiting server confirmation.
    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    /// Reference to this message if it is confirmed.
    pub fn message_ref(&self) -> Option<MessageRef> {
        self.id.map(|id| MessageRef {
            id,
            created_at: self.created_at,
        })
    }

    /// Pin or unpin. Returns false if nothing changed.
    pub fn set_pinned(&mut self, pinned: bool) -> bool {
        if self.is_pinned == pinned {
            return false;
        }
        self.is_pinned = pinned;
        true
    }

    /// Replace the content with a recall tombstone. Returns false if the
    /// message was already recalled.
    pub fn recall(&mut self) -> bool {
        if self.is_recalled {
            return false;
        }
        self.is_recalled = true;
        self.content.clear();
        self.media_url = None;
        true
    }
}

/// Reference to a confirmed message.
///
/// Orders by `(created_at, id)`, the display order of the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Server id.
    pub id: MessageId,
    /// Server timestamp.
    pub created_at: Timestamp,
}

impl Ord for MessageRef {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.created_at, self.id).cmp(&(other.created_at, other.id))
    }
}

impl PartialOrd for MessageRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What the local user asked to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingPayload {
    /// Content kind.
    pub kind: MessageKind,
    /// Text content or caption.
    pub content: String,
    /// Already-uploaded media location.
    pub media_url: Option<String>,
    /// Message being replied to.
    pub reply_to: Option<MessageId>,
}

impl OutgoingPayload {
    /// A plain text payload.
    pub fn text(content: &str) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.to_string(),
            media_url: None,
            reply_to: None,
        }
    }

    /// A media payload with an optional caption.
    pub fn media(kind: MessageKind, media_url: &str, caption: &str) -> Self {
        Self {
            kind,
            content: caption.to_string(),
            media_url: Some(media_url.to_string()),
            reply_to: None,
        }
    }

    /// Mark this payload as a reply.
    pub fn replying_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }
}

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// One-to-one conversation.
    Direct,
    /// Group conversation (requires join/leave on the channel).
    Group,
}

/// A conversation as seen by the engine for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Direct or group.
    pub kind: ConversationKind,
    /// Participants including the local user.
    pub participants: Vec<UserId>,
}

impl Conversation {
    /// A one-to-one conversation between two users.
    pub fn direct(id: ConversationId, a: UserId, b: UserId) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            participants: vec![a, b],
        }
    }

    /// A group conversation.
    pub fn group(id: ConversationId, participants: Vec<UserId>) -> Self {
        Self {
            id,
            kind: ConversationKind::Group,
            participants,
        }
    }

    /// Check if this is a group conversation.
    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }
}

/// One page of history as returned by the REST API (newest first).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Messages on this page, newest first.
    pub messages: Vec<Message>,
    /// Total number of messages in the conversation.
    pub total_count: u64,
    /// Rows the server returned, including any dropped as malformed.
    /// Decides whether the page was short.
    #[serde(default)]
    pub returned: usize,
}

impl HistoryPage {
    /// A page where every returned row was usable.
    pub fn new(messages: Vec<Message>, total_count: u64) -> Self {
        Self {
            returned: messages.len(),
            messages,
            total_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::new(1)
    }

    #[test]
    fn reactions_add_is_idempotent() {
        let mut r = Reactions::new();
        assert!(r.add("👍", UserId::new(1)));
        assert!(!r.add("👍", UserId::new(1)));
        assert_eq!(r.total(), 1);
    }

    #[test]
    fn reactions_remove_drops_empty_bucket() {
        let mut r = Reactions::new();
        r.add("❤️", UserId::new(1));
        assert!(r.remove("❤️", UserId::new(1)));
        assert!(!r.remove("❤️", UserId::new(1)));
        assert!(r.is_empty());
        assert_eq!(r, Reactions::new());
    }

    #[test]
    fn reactions_collect_from_pairs() {
        let r: Reactions = vec![
            ("👍".to_string(), UserId::new(1)),
            ("👍".to_string(), UserId::new(2)),
            ("😂".to_string(), UserId::new(1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(r.users("👍").count(), 2);
        assert!(r.contains("😂", UserId::new(1)));
    }

    #[test]
    fn pending_message_has_no_id() {
        let temp = ClientTempId::new();
        let msg = Message::pending(
            temp,
            conv(),
            UserId::new(1),
            &OutgoingPayload::text("hi"),
            Timestamp::from_millis(5),
        );
        assert!(msg.is_pending());
        assert_eq!(msg.client_temp_id, Some(temp));
        assert!(msg.message_ref().is_none());
    }

    #[test]
    fn recall_clears_content_once() {
        let mut msg = Message::confirmed(
            MessageId::new(1),
            conv(),
            UserId::new(1),
            "secret",
            Timestamp::from_millis(1),
        );
        msg.media_url = Some("https://cdn/x.png".into());
        assert!(msg.recall());
        assert!(msg.is_recalled);
        assert!(msg.content.is_empty());
        assert!(msg.media_url.is_none());
        assert!(!msg.recall());
    }

    #[test]
    fn message_ref_orders_by_time_then_id() {
        let a = MessageRef {
            id: MessageId::new(9),
            created_at: Timestamp::from_millis(10),
        };
        let b = MessageRef {
            id: MessageId::new(2),
            created_at: Timestamp::from_millis(20),
        };
        let c = MessageRef {
            id: MessageId::new(3),
            created_at: Timestamp::from_millis(20),
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn message_kind_from_wire_is_case_insensitive() {
        assert_eq!(MessageKind::from_wire("Image"), Some(MessageKind::Image));
        assert_eq!(MessageKind::from_wire("TEXT"), Some(MessageKind::Text));
        assert_eq!(MessageKind::from_wire("sticker"), None);
    }
}
