//! Typed push-channel traffic.
//!
//! [`ChannelEvent`] is what the push channel delivers for one conversation
//! after boundary normalization (see [`crate::wire`]); [`OutboundCommand`]
//! is what the engine invokes on the channel.

use serde::{Deserialize, Serialize};

use crate::{
    ClientTempId, ConversationId, Message, MessageId, OutgoingPayload, Reactions, Timestamp,
    UserId,
};

/// Events delivered by the push channel.
///
/// Delivery is at-least-once and unordered across event types, so every
/// consumer of these events must be idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// A message was posted to the conversation (possibly our own echo).
    MessageReceived {
        /// The confirmed message; carries `client_temp_id` when it echoes
        /// one of our optimistic sends.
        message: Message,
    },
    /// The server confirmed one of our sends.
    MessageSentAck {
        /// Correlation id of the send.
        client_temp_id: ClientTempId,
        /// The confirmed message.
        message: Message,
    },
    /// The server could not persist one of our sends.
    MessageSaveFailed {
        /// Correlation id of the send.
        client_temp_id: ClientTempId,
        /// Server-provided reason.
        reason: String,
    },
    /// A peer started or stopped typing.
    Typing {
        /// The peer.
        user_id: UserId,
        /// Whether they are typing.
        is_typing: bool,
    },
    /// Full list of users currently online.
    PresenceSnapshot {
        /// Online users.
        online: Vec<UserId>,
    },
    /// A user came online.
    UserOnline {
        /// The user.
        user_id: UserId,
    },
    /// A user went offline.
    UserOffline {
        /// The user.
        user_id: UserId,
        /// When they were last seen, if the server knows.
        last_seen: Option<Timestamp>,
    },
    /// A single reaction was added.
    ReactionAdded {
        /// Target message.
        message_id: MessageId,
        /// Reacting user.
        user_id: UserId,
        /// Emoji.
        emoji: String,
    },
    /// A single reaction was removed.
    ReactionRemoved {
        /// Target message.
        message_id: MessageId,
        /// Reacting user.
        user_id: UserId,
        /// Emoji.
        emoji: String,
    },
    /// The server sent the authoritative reaction map for a message.
    ReactionsReplaced {
        /// Target message.
        message_id: MessageId,
        /// Complete reaction map.
        reactions: Reactions,
    },
    /// A participant read up to a message.
    MessageRead {
        /// Reader.
        user_id: UserId,
        /// Newest message they have read.
        message_id: MessageId,
        /// When they read it.
        read_at: Timestamp,
    },
    /// A message was recalled by its author.
    MessageRecalled {
        /// Recalled message.
        message_id: MessageId,
    },
    /// A message was deleted.
    MessageDeleted {
        /// Deleted message.
        message_id: MessageId,
    },
    /// A message was pinned or unpinned.
    MessagePinned {
        /// Target message.
        message_id: MessageId,
        /// New pin state.
        pinned: bool,
        /// Who changed it, if the server says.
        by: Option<UserId>,
    },
    /// A user joined the group.
    ParticipantJoined {
        /// The user.
        user_id: UserId,
    },
    /// A user left the group.
    ParticipantLeft {
        /// The user.
        user_id: UserId,
    },
}

impl ChannelEvent {
    /// Short event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageReceived { .. } => "message-received",
            Self::MessageSentAck { .. } => "message-sent-ack",
            Self::MessageSaveFailed { .. } => "message-save-failed",
            Self::Typing { .. } => "typing",
            Self::PresenceSnapshot { .. } => "presence-snapshot",
            Self::UserOnline { .. } => "user-online",
            Self::UserOffline { .. } => "user-offline",
            Self::ReactionAdded { .. } => "reaction-added",
            Self::ReactionRemoved { .. } => "reaction-removed",
            Self::ReactionsReplaced { .. } => "reactions-replaced",
            Self::MessageRead { .. } => "message-read",
            Self::MessageRecalled { .. } => "message-recalled",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::MessagePinned { .. } => "message-pinned",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
        }
    }
}

/// Invocations the engine makes on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Post a message.
    SendMessage {
        /// Target conversation.
        conversation_id: ConversationId,
        /// Correlation id the server must echo back.
        client_temp_id: ClientTempId,
        /// Message content.
        payload: OutgoingPayload,
    },
    /// Broadcast the local typing state.
    SetTyping {
        /// Target conversation.
        conversation_id: ConversationId,
        /// Whether the local user is typing.
        is_typing: bool,
    },
    /// Acknowledge reading up to a message.
    MarkRead {
        /// Target conversation.
        conversation_id: ConversationId,
        /// Newest message read.
        message_id: MessageId,
    },
    /// Add or remove a reaction.
    React {
        /// Target message.
        message_id: MessageId,
        /// Emoji.
        emoji: String,
        /// True to add, false to remove.
        add: bool,
    },
    /// Recall one of our messages.
    Recall {
        /// Target message.
        message_id: MessageId,
    },
    /// Delete a message.
    Delete {
        /// Target message.
        message_id: MessageId,
    },
    /// Ask for a presence snapshot.
    GetOnlineUsers,
    /// Subscribe to a group's events.
    JoinGroup {
        /// Group conversation.
        conversation_id: ConversationId,
    },
    /// Unsubscribe from a group's events.
    LeaveGroup {
        /// Group conversation.
        conversation_id: ConversationId,
    },
}

impl OutboundCommand {
    /// Short command name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send-message",
            Self::SetTyping { .. } => "set-typing",
            Self::MarkRead { .. } => "mark-read",
            Self::React { .. } => "react",
            Self::Recall { .. } => "recall",
            Self::Delete { .. } => "delete",
            Self::GetOnlineUsers => "get-online-users",
            Self::JoinGroup { .. } => "join-group",
            Self::LeaveGroup { .. } => "leave-group",
        }
    }
}
