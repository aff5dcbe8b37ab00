//! Push channel abstraction for convo-sync.
//!
//! This module provides the bidirectional, conversation-scoped event stream
//! the engine consumes. Reconnection is the channel's job; the engine only
//! observes it through [`ChannelSignal`]s.
//!
//! # Design
//!
//! The channel trait is async:
//! - `subscribe()` scopes the event stream to one conversation
//! - `invoke()` sends one outbound command
//! - `recv()` yields the next named event or connection signal
//! - `unsubscribe()` releases the subscription
//!
//! # Example
//!
//! ```ignore
//! let channel = MockChannel::new();
//! channel.subscribe(ConversationId::new(1)).await?;
//! channel.invoke(OutboundCommand::GetOnlineUsers).await?;
//! let signal = channel.recv().await?;
//! ```

mod mock;

pub use mock::MockChannel;

use async_trait::async_trait;
use convo_sync_types::{ConversationId, OutboundCommand};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed for good; no further signals will arrive.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// REST request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Server response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Operation timed out.
    #[error("timeout")]
    Timeout,
}

/// What the push channel delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// A named hub event with its raw payload.
    Event {
        /// Hub method name, e.g. `ReceiveMessage`.
        name: String,
        /// Raw JSON payload.
        payload: serde_json::Value,
    },
    /// The connection dropped; the channel is reconnecting on its own.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },
    /// The connection is back.
    Reconnected,
}

impl ChannelSignal {
    /// Convenience constructor for an event signal.
    pub fn event(name: &str, payload: serde_json::Value) -> Self {
        Self::Event {
            name: name.to_string(),
            payload,
        }
    }
}

/// Push channel for one conversation.
///
/// Implementations handle the underlying connection mechanism
/// (SignalR hub, WebSocket, mock, etc).
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Scope the event stream to `conversation`.
    async fn subscribe(&self, conversation: ConversationId) -> Result<(), TransportError>;

    /// Invoke a hub method.
    async fn invoke(&self, command: OutboundCommand) -> Result<(), TransportError>;

    /// Receive the next signal.
    ///
    /// Blocks until one is available. Returns
    /// [`TransportError::ConnectionClosed`] once the channel is gone for good.
    async fn recv(&self) -> Result<ChannelSignal, TransportError>;

    /// Release the subscription.
    async fn unsubscribe(&self) -> Result<(), TransportError>;
}
