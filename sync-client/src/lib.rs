//! # sync-client
//!
//! Async conversation sync engine for convo-sync.
//!
//! This is the library a chat UI binds to: one [`EngineHandle`] per open
//! conversation, publishing a [`Snapshot`] after every change.
//!
//! ## Features
//!
//! - **Optimistic sends**: messages show up immediately and reconcile with
//!   the server echo; a REST fallback covers missing acks
//! - **Paged history**: newest-first pages merged without duplicates
//! - **Live signals**: typing, presence, reactions, read receipts
//! - **Collaborator traits**: pluggable push channel and REST API (mocks included)
//! - **Pure core**: all bookkeeping lives in sync-core; this crate only does I/O
//!
//! ## Example
//!
//! ```ignore
//! use convo_sync_client::{ConversationSyncEngine, EngineConfig, MockChannel, MockRest};
//!
//! let engine = ConversationSyncEngine::spawn(
//!     conversation,
//!     me,
//!     MockChannel::new(),
//!     MockRest::new(),
//!     MemoryKeyValueStore::shared(),
//!     EngineConfig::default(),
//! );
//!
//! let temp = engine.send_text("hello").await?;
//! engine.delivery(temp).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod rest;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use engine::{
    ConversationSyncEngine, Delivery, EngineError, EngineHandle, MessageView, Snapshot,
};
pub use rest::{MockRest, RestApi};
pub use transport::{ChannelSignal, MockChannel, PushChannel, TransportError};
