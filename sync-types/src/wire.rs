//! Boundary normalization of loosely-typed server payloads.
//!
//! The hub and REST API emit JSON whose field names vary between
//! endpoints (`content`/`message`, `createdAt`/`created_at`/`timestamp`,
//! PascalCase vs camelCase vs snake_case). Everything is normalized here,
//! once, into the typed shapes of this crate; nothing past this module
//! branches on field-name variants.

use chrono::DateTime;
use serde_json::Value;

use crate::{
    ChannelEvent, ClientTempId, ConversationId, HistoryPage, Message, MessageId, MessageKind,
    Reactions, SyncError, Timestamp, UserId,
};

const ID: &[&str] = &["id", "Id", "messageId", "MessageId", "message_id"];
const MESSAGE_ID: &[&str] = &["messageId", "MessageId", "message_id", "id", "Id"];
const CLIENT_TEMP_ID: &[&str] = &[
    "clientTempId",
    "clientTempID",
    "ClientTempId",
    "client_temp_id",
    "tempId",
];
const CONVERSATION_ID: &[&str] = &["conversationId", "ConversationId", "conversation_id"];
const SENDER: &[&str] = &[
    "senderId",
    "sender_id",
    "userId",
    "UserId",
    "user_id",
    "SenderId",
];
const USER: &[&str] = &["userId", "UserId", "user_id", "id"];
const CONTENT: &[&str] = &["content", "Content", "message"];
const KIND: &[&str] = &["messageType", "MessageType", "message_type", "kind"];
const MEDIA: &[&str] = &[
    "mediaUrl",
    "media_url",
    "fileUrl",
    "FileUrl",
    "file_url",
    "MediaUrl",
];
const CREATED_AT: &[&str] = &["createdAt", "CreatedAt", "created_at", "timestamp"];
const REPLY_TO: &[&str] = &[
    "replyToId",
    "replyToMessageId",
    "ReplyToMessageId",
    "reply_to_id",
    "replyTo",
    "ReplyTo",
];
const RECALLED: &[&str] = &["isRecalled", "IsRecalled", "is_recalled"];
const PINNED: &[&str] = &["isPinned", "IsPinned", "is_pinned"];
const PINNED_BY: &[&str] = &["pinnedBy", "unpinnedBy", "PinnedBy", "UnpinnedBy"];
const REACTIONS: &[&str] = &["reactions", "Reactions"];
const READ_BY: &[&str] = &["readBy", "ReadBy", "read_by"];
const READ_AT: &[&str] = &["readAt", "ReadAt", "read_at"];
const LAST_SEEN: &[&str] = &["lastSeen", "LastSeen", "last_seen"];
const EMOJI: &[&str] = &["emoji", "Emoji", "reactionType", "reaction"];
const IS_TYPING: &[&str] = &["isTyping", "IsTyping", "is_typing"];
const REASON: &[&str] = &["reason", "error", "Error", "message"];
const READ_MESSAGE_ID: &[&str] = &[
    "messageId",
    "MessageId",
    "message_id",
    "lastMessageId",
    "last_read_message_id",
];
const PAGE_MESSAGES: &[&str] = &["messages", "Messages", "items", "data"];
const TOTAL: &[&str] = &["totalCount", "TotalCount", "total_count", "total"];

/// Look up the first alias present (and non-null) on an object.
fn field<'a>(payload: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let obj = payload.as_object()?;
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|value| !value.is_null())
}

/// Numeric ids arrive as numbers or numeric strings.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id_field(payload: &Value, names: &'static [&'static str]) -> Result<u64, SyncError> {
    field(payload, names)
        .and_then(as_u64)
        .ok_or(SyncError::MissingField(names[0]))
}

fn optional_id(payload: &Value, names: &[&str]) -> Option<u64> {
    let value = field(payload, names)?;
    // `replyTo` may be a nested message object rather than a bare id
    as_u64(value).or_else(|| field(value, ID).and_then(as_u64))
}

fn string_field(payload: &Value, names: &[&str]) -> Option<String> {
    field(payload, names)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parse a timestamp given as RFC 3339 text or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_i64().map(Timestamp::from_millis),
        Value::String(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(Timestamp::from_millis(parsed.timestamp_millis()));
            }
            // Server sometimes omits the offset; treat as UTC
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Timestamp::from_millis(naive.and_utc().timestamp_millis()))
        }
        _ => None,
    }
}

fn client_temp_id(payload: &Value) -> Option<ClientTempId> {
    field(payload, CLIENT_TEMP_ID)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// A user reference is a bare id or an object with a user id field.
fn user_ref(value: &Value) -> Option<UserId> {
    as_u64(value)
        .or_else(|| field(value, USER).and_then(as_u64))
        .map(UserId::new)
}

fn parse_reactions(value: &Value) -> Reactions {
    let Some(map) = value.as_object() else {
        return Reactions::new();
    };
    map.iter()
        .flat_map(|(emoji, users)| {
            users
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(user_ref)
                .map(move |user| (emoji.clone(), user))
        })
        .collect()
}

/// Normalize one message payload.
///
/// `conversation` is used when the payload does not name its conversation
/// (the channel is already scoped to one).
pub fn parse_message(conversation: ConversationId, payload: &Value) -> Result<Message, SyncError> {
    if !payload.is_object() {
        return Err(SyncError::InvalidData("message payload is not an object".into()));
    }

    let sender = field(payload, SENDER)
        .and_then(as_u64)
        .ok_or_else(|| SyncError::MalformedMessage("missing sender".into()))?;

    let content = string_field(payload, CONTENT).unwrap_or_default();
    let media_url = string_field(payload, MEDIA).filter(|url| !url.trim().is_empty());
    let is_recalled = field(payload, RECALLED)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if content.trim().is_empty() && media_url.is_none() && !is_recalled {
        return Err(SyncError::MalformedMessage("no content and no media".into()));
    }

    let created_at = field(payload, CREATED_AT)
        .and_then(parse_timestamp)
        .ok_or_else(|| SyncError::MalformedMessage("missing or invalid timestamp".into()))?;

    let kind = string_field(payload, KIND)
        .and_then(|name| MessageKind::from_wire(&name))
        .unwrap_or(if media_url.is_some() {
            MessageKind::File
        } else {
            MessageKind::Text
        });

    let conversation_id = field(payload, CONVERSATION_ID)
        .and_then(as_u64)
        .map(ConversationId::new)
        .unwrap_or(conversation);

    let read_by = field(payload, READ_BY)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(user_ref)
        .collect();

    Ok(Message {
        id: field(payload, ID).and_then(as_u64).map(MessageId::new),
        client_temp_id: client_temp_id(payload),
        conversation_id,
        sender_id: UserId::new(sender),
        kind,
        content,
        media_url,
        created_at,
        reply_to_id: optional_id(payload, REPLY_TO).map(MessageId::new),
        is_recalled,
        is_pinned: field(payload, PINNED)
            .and_then(Value::as_bool)
            .unwrap_or(false),
        reactions: field(payload, REACTIONS)
            .map(parse_reactions)
            .unwrap_or_default(),
        read_by,
    })
}

fn confirmed_message(conversation: ConversationId, payload: &Value) -> Result<Message, SyncError> {
    let message = parse_message(conversation, payload)?;
    if message.id.is_none() {
        return Err(SyncError::MissingField("id"));
    }
    Ok(message)
}

/// Normalize a REST history page. Malformed messages are dropped but still
/// counted in [`HistoryPage::returned`].
pub fn parse_history_page(
    conversation: ConversationId,
    payload: &Value,
) -> Result<HistoryPage, SyncError> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        _ => field(payload, PAGE_MESSAGES)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or(SyncError::MissingField("messages"))?,
    };

    let messages: Vec<Message> = items
        .iter()
        .filter_map(|item| confirmed_message(conversation, item).ok())
        .collect();

    let total_count = field(payload, TOTAL)
        .and_then(as_u64)
        .unwrap_or(items.len() as u64);

    Ok(HistoryPage {
        messages,
        total_count,
        returned: items.len(),
    })
}

/// Normalize a named hub event into a [`ChannelEvent`].
pub fn parse_event(
    conversation: ConversationId,
    name: &str,
    payload: &Value,
) -> Result<ChannelEvent, SyncError> {
    match name {
        "ReceiveMessage" => Ok(ChannelEvent::MessageReceived {
            message: confirmed_message(conversation, payload)?,
        }),
        "MessageSent" => {
            let message = confirmed_message(conversation, payload)?;
            let client_temp_id = message
                .client_temp_id
                .ok_or(SyncError::MissingField("clientTempId"))?;
            Ok(ChannelEvent::MessageSentAck {
                client_temp_id,
                message,
            })
        }
        "MessageSaveFailed" => Ok(ChannelEvent::MessageSaveFailed {
            client_temp_id: client_temp_id(payload)
                .ok_or(SyncError::MissingField("clientTempId"))?,
            reason: string_field(payload, REASON).unwrap_or_else(|| "save failed".into()),
        }),
        "UserTyping" | "UserStoppedTyping" => {
            let user_id = user_ref(payload).ok_or(SyncError::MissingField("userId"))?;
            let is_typing = if name == "UserStoppedTyping" {
                false
            } else {
                field(payload, IS_TYPING)
                    .and_then(Value::as_bool)
                    .unwrap_or(true)
            };
            Ok(ChannelEvent::Typing { user_id, is_typing })
        }
        "OnlineUsers" => {
            let list = match payload {
                Value::Array(items) => items.as_slice(),
                _ => field(payload, &["userIds", "users", "online"])
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .ok_or(SyncError::MissingField("userIds"))?,
            };
            Ok(ChannelEvent::PresenceSnapshot {
                online: list.iter().filter_map(user_ref).collect(),
            })
        }
        "UserOnline" => Ok(ChannelEvent::UserOnline {
            user_id: user_ref(payload).ok_or(SyncError::MissingField("userId"))?,
        }),
        "UserOffline" => Ok(ChannelEvent::UserOffline {
            user_id: user_ref(payload).ok_or(SyncError::MissingField("userId"))?,
            last_seen: field(payload, LAST_SEEN).and_then(parse_timestamp),
        }),
        "ReactionAdded" | "ReactionRemoved" => {
            let message_id = MessageId::new(id_field(payload, MESSAGE_ID)?);
            if let Some(map) = field(payload, REACTIONS) {
                return Ok(ChannelEvent::ReactionsReplaced {
                    message_id,
                    reactions: parse_reactions(map),
                });
            }
            let user_id = UserId::new(id_field(payload, USER)?);
            let emoji = string_field(payload, EMOJI).ok_or(SyncError::MissingField("emoji"))?;
            if name == "ReactionAdded" {
                Ok(ChannelEvent::ReactionAdded {
                    message_id,
                    user_id,
                    emoji,
                })
            } else {
                Ok(ChannelEvent::ReactionRemoved {
                    message_id,
                    user_id,
                    emoji,
                })
            }
        }
        "MessageRead" | "MessagesRead" => Ok(ChannelEvent::MessageRead {
            user_id: UserId::new(id_field(payload, USER)?),
            message_id: MessageId::new(id_field(payload, READ_MESSAGE_ID)?),
            read_at: field(payload, READ_AT)
                .and_then(parse_timestamp)
                .unwrap_or_else(Timestamp::now),
        }),
        "MessageRecalled" => Ok(ChannelEvent::MessageRecalled {
            message_id: MessageId::new(
                as_u64(payload)
                    .map(Ok)
                    .unwrap_or_else(|| id_field(payload, MESSAGE_ID))?,
            ),
        }),
        "MessageDeleted" => Ok(ChannelEvent::MessageDeleted {
            message_id: MessageId::new(
                as_u64(payload)
                    .map(Ok)
                    .unwrap_or_else(|| id_field(payload, MESSAGE_ID))?,
            ),
        }),
        "MessagePinned" | "MessageUnpinned" => Ok(ChannelEvent::MessagePinned {
            message_id: MessageId::new(id_field(payload, MESSAGE_ID)?),
            pinned: name == "MessagePinned",
            by: field(payload, PINNED_BY).and_then(user_ref),
        }),
        // The hub sends membership changes in lowercase
        "userjoined" | "UserJoined" => Ok(ChannelEvent::ParticipantJoined {
            user_id: user_ref(payload).ok_or(SyncError::MissingField("userId"))?,
        }),
        "userleft" | "UserLeft" => Ok(ChannelEvent::ParticipantLeft {
            user_id: user_ref(payload).ok_or(SyncError::MissingField("userId"))?,
        }),
        other => Err(SyncError::UnknownEvent(other.to_string())),
    }
}

/// Parse a `{ "name": ..., "payload": ... }` frame as produced by hub
/// bridges that forward raw invocations.
pub fn parse_frame(conversation: ConversationId, frame: &str) -> Result<ChannelEvent, SyncError> {
    let value: Value = serde_json::from_str(frame).map_err(SyncError::Deserialization)?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or(SyncError::MissingField("name"))?;
    let payload = value.get("payload").unwrap_or(&Value::Null);
    parse_event(conversation, name, payload)
}
