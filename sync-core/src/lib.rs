//! # sync-core
//!
//! Pure conversation sync logic for convo-sync (no I/O, instant tests).
//!
//! This crate implements the trackers and state machines behind one
//! conversation without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is always passed in, and every timer lives in a
//! [`Timers`] arena owned by the caller. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about reconciliation and ordering
//!
//! The actual I/O (push channel, REST) is performed by `sync-client`, which
//! drives these components from a single task per conversation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod kv;
pub mod outbox;
pub mod pagination;
pub mod presence;
pub mod queue;
pub mod reactions;
pub mod receipts;
pub mod state;
pub mod store;
pub mod timers;
pub mod typing;

pub use kv::{KeyValueStore, MemoryKeyValueStore, SharedKeyValueStore};
pub use outbox::{
    AckOutcome, FallbackOutcome, FallbackRequest, OptimisticSendTracker, PendingSend, SendError,
    SendStatus,
};
pub use pagination::{LoadStep, PageError, PageRequest, PaginationController};
pub use presence::{PresenceEntry, PresenceTracker};
pub use queue::{CommandQueue, Queued};
pub use reactions::ReactionLedger;
pub use receipts::{ReadReceipt, ReadReceiptTracker};
pub use state::{Action, EngineState, Event};
pub use store::{MessageStore, ReactionOp, UpsertOutcome};
pub use timers::{TimerId, TimerKind, Timers};
pub use typing::{TypingConfig, TypingCoordinator};
