//! # sync-types
//!
//! Data model and wire types for convo-sync.
//!
//! This crate provides the foundational types used across all convo-sync crates:
//! - [`ConversationId`], [`UserId`], [`MessageId`], [`ClientTempId`], [`Timestamp`] - Identity and ordering types
//! - [`Message`], [`Conversation`], [`Reactions`] - The conversation data model
//! - [`ChannelEvent`], [`OutboundCommand`] - Push channel traffic
//! - [`wire`] - Normalization of loosely-typed server payloads
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod ids;
mod message;
pub mod wire;

pub use error::SyncError;
pub use event::{ChannelEvent, OutboundCommand};
pub use ids::{ClientTempId, ConversationId, MessageId, Timestamp, UserId};
pub use message::{
    Conversation, ConversationKind, HistoryPage, Message, MessageKind, MessageRef,
    OutgoingPayload, Reactions,
};
