//! Mock push channel for testing.
//!
//! Allows queueing incoming signals and capturing invoked commands for
//! verification. Optionally acknowledges sends the way the hub does.

use super::{ChannelSignal, PushChannel, TransportError};
use async_trait::async_trait;
use convo_sync_types::{ConversationId, OutboundCommand, Timestamp, UserId};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Mock push channel for testing.
///
/// Clones share state, so a test can keep one clone while the engine owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MockChannel {
    inner: Arc<Mutex<MockChannelInner>>,
    incoming: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockChannelInner {
    subscribed: Option<ConversationId>,
    subscribe_calls: usize,
    invoked: Vec<OutboundCommand>,
    receive_queue: VecDeque<ChannelSignal>,
    closed: bool,
    fail_next_subscribe: Option<String>,
    fail_next_invoke: Option<String>,
    fail_sends: Option<String>,
    auto_ack: Option<UserId>,
    next_message_id: u64,
    stall_invokes: bool,
}

impl MockChannel {
    /// Create a new mock channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge every `send-message` with a `MessageSent` event, as the
    /// hub would, attributing the message to `sender`. Ids start after
    /// `last_id`.
    pub fn with_auto_ack(self, sender: UserId, last_id: u64) -> Self {
        self.set_auto_ack(sender, last_id);
        self
    }

    /// Turn on auto-ack for an existing (possibly shared) channel.
    pub fn set_auto_ack(&self, sender: UserId, last_id: u64) {
        let mut inner = self.lock();
        inner.auto_ack = Some(sender);
        inner.next_message_id = last_id + 1;
    }

    /// Queue a signal to be returned by `recv()`.
    pub fn push_signal(&self, signal: ChannelSignal) {
        self.lock().receive_queue.push_back(signal);
        self.incoming.notify_one();
    }

    /// Queue a named hub event.
    pub fn push_event(&self, name: &str, payload: serde_json::Value) {
        self.push_signal(ChannelSignal::event(name, payload));
    }

    /// Simulate a dropped connection.
    pub fn disconnect(&self, reason: &str) {
        self.push_signal(ChannelSignal::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Simulate the connection coming back.
    pub fn reconnect(&self) {
        self.push_signal(ChannelSignal::Reconnected);
    }

    /// Close the channel for good; pending and future `recv()` calls fail.
    pub fn close(&self) {
        self.lock().closed = true;
        self.incoming.notify_one();
    }

    /// All commands that were invoked, in order.
    pub fn invoked(&self) -> Vec<OutboundCommand> {
        self.lock().invoked.clone()
    }

    /// Invoked commands with the given name.
    pub fn invoked_named(&self, name: &str) -> Vec<OutboundCommand> {
        self.lock()
            .invoked
            .iter()
            .filter(|c| c.name() == name)
            .cloned()
            .collect()
    }

    /// Conversation currently subscribed to.
    pub fn subscribed(&self) -> Option<ConversationId> {
        self.lock().subscribed
    }

    /// Number of `subscribe()` calls so far.
    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    /// Cause the next subscribe() to fail with the given error.
    pub fn fail_next_subscribe(&self, error: &str) {
        self.lock().fail_next_subscribe = Some(error.to_string());
    }

    /// Cause the next invoke() to fail with the given error.
    pub fn fail_next_invoke(&self, error: &str) {
        self.lock().fail_next_invoke = Some(error.to_string());
    }

    /// Make every `send-message` fail until cleared with `None`.
    pub fn fail_sends(&self, error: Option<&str>) {
        self.lock().fail_sends = error.map(str::to_string);
    }

    /// Make invoke() record the command and then never complete, like a
    /// hub connection that stopped answering.
    pub fn stall_invokes(&self, stall: bool) {
        self.lock().stall_invokes = stall;
    }

    /// Apply forced failures and auto-ack, then log the command. Returns
    /// whether the invocation should stall.
    fn record_invoke(&self, command: OutboundCommand) -> Result<bool, TransportError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_invoke.take() {
            return Err(TransportError::SendFailed(error));
        }
        if let (OutboundCommand::SendMessage { .. }, Some(error)) = (&command, &inner.fail_sends) {
            return Err(TransportError::SendFailed(error.clone()));
        }

        if let (
            OutboundCommand::SendMessage {
                conversation_id,
                client_temp_id,
                payload,
            },
            Some(sender),
        ) = (&command, inner.auto_ack)
        {
            let id = inner.next_message_id;
            inner.next_message_id += 1;
            inner.receive_queue.push_back(ChannelSignal::event(
                "MessageSent",
                json!({
                    "id": id,
                    "conversationId": conversation_id.value(),
                    "senderId": sender.value(),
                    "content": payload.content,
                    "fileUrl": payload.media_url,
                    "createdAt": Timestamp::now().as_millis(),
                    "clientTempId": client_temp_id.to_string(),
                }),
            ));
            self.incoming.notify_one();
        }

        inner.invoked.push(command);
        Ok(inner.stall_invokes)
    }

    fn lock(&self) -> MutexGuard<'_, MockChannelInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PushChannel for MockChannel {
    async fn subscribe(&self, conversation: ConversationId) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.subscribe_calls += 1;

        // Check for forced failure
        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.subscribed = Some(conversation);
        Ok(())
    }

    async fn invoke(&self, command: OutboundCommand) -> Result<(), TransportError> {
        let stalled = self.record_invoke(command)?;
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn recv(&self) -> Result<ChannelSignal, TransportError> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(signal) = inner.receive_queue.pop_front() {
                    return Ok(signal);
                }
                if inner.closed {
                    return Err(TransportError::ConnectionClosed);
                }
            }
            self.incoming.notified().await;
        }
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.lock().subscribed = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_sync_types::{ClientTempId, OutgoingPayload};

    // ===========================================
    // MockChannel Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_channel_subscribes() {
        let channel = MockChannel::new();
        assert!(channel.subscribed().is_none());

        channel.subscribe(ConversationId::new(3)).await.unwrap();

        assert_eq!(channel.subscribed(), Some(ConversationId::new(3)));
        channel.unsubscribe().await.unwrap();
        assert!(channel.subscribed().is_none());
    }

    #[tokio::test]
    async fn mock_channel_records_invocations() {
        let channel = MockChannel::new();
        channel.invoke(OutboundCommand::GetOnlineUsers).await.unwrap();
        channel
            .invoke(OutboundCommand::SetTyping {
                conversation_id: ConversationId::new(1),
                is_typing: true,
            })
            .await
            .unwrap();

        assert_eq!(channel.invoked().len(), 2);
        assert_eq!(channel.invoked_named("set-typing").len(), 1);
    }

    #[tokio::test]
    async fn mock_channel_delivers_queued_signals() {
        let channel = MockChannel::new();
        channel.push_event("UserOnline", json!({ "userId": 2 }));
        channel.disconnect("wifi");

        assert!(matches!(channel.recv().await.unwrap(), ChannelSignal::Event { .. }));
        assert_eq!(
            channel.recv().await.unwrap(),
            ChannelSignal::Disconnected {
                reason: "wifi".into()
            }
        );
    }

    #[tokio::test]
    async fn recv_waits_for_signal() {
        let channel = MockChannel::new();
        let producer = channel.clone();
        let handle = tokio::spawn(async move { channel.recv().await });

        tokio::task::yield_now().await;
        producer.reconnect();

        assert_eq!(handle.await.unwrap().unwrap(), ChannelSignal::Reconnected);
    }

    #[tokio::test]
    async fn closed_channel_ends_recv() {
        let channel = MockChannel::new();
        channel.close();

        assert_eq!(channel.recv().await, Err(TransportError::ConnectionClosed));
        assert!(channel.invoke(OutboundCommand::GetOnlineUsers).await.is_err());
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn forced_subscribe_failure() {
        let channel = MockChannel::new();
        channel.fail_next_subscribe("hub down");

        let result = channel.subscribe(ConversationId::new(1)).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(channel.subscribed().is_none());
        assert_eq!(channel.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn failed_sends_are_not_recorded() {
        let channel = MockChannel::new();
        channel.fail_sends(Some("offline"));

        let result = channel
            .invoke(OutboundCommand::SendMessage {
                conversation_id: ConversationId::new(1),
                client_temp_id: ClientTempId::new(),
                payload: OutgoingPayload::text("hi"),
            })
            .await;

        assert!(matches!(result, Err(TransportError::SendFailed(_))));
        assert!(channel.invoked().is_empty());
        // Non-send commands still go through
        channel.invoke(OutboundCommand::GetOnlineUsers).await.unwrap();
    }

    #[tokio::test]
    async fn auto_ack_echoes_sends() {
        let channel = MockChannel::new().with_auto_ack(UserId::new(1), 41);
        let temp = ClientTempId::new();
        channel
            .invoke(OutboundCommand::SendMessage {
                conversation_id: ConversationId::new(1),
                client_temp_id: temp,
                payload: OutgoingPayload::text("hi"),
            })
            .await
            .unwrap();

        match channel.recv().await.unwrap() {
            ChannelSignal::Event { name, payload } => {
                assert_eq!(name, "MessageSent");
                assert_eq!(payload["id"], 42);
                assert_eq!(payload["clientTempId"], temp.to_string());
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }
}
