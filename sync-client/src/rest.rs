//! REST collaborators: paged history and the fallback send path.

use async_trait::async_trait;
use convo_sync_types::{
    ClientTempId, ConversationId, HistoryPage, Message, MessageId, OutgoingPayload, Timestamp,
    UserId,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::transport::TransportError;

/// History and fallback-send endpoints.
#[async_trait]
pub trait RestApi: Send + Sync {
    /// Fetch one page of history, newest first. Page 1 is the newest.
    async fn get_page(
        &self,
        conversation: ConversationId,
        page: u32,
        page_size: usize,
    ) -> Result<HistoryPage, TransportError>;

    /// Post a message directly, bypassing the push channel.
    ///
    /// The returned message carries `client_temp_id` so it can be
    /// reconciled like a channel echo.
    async fn send_message(
        &self,
        conversation: ConversationId,
        client_temp_id: ClientTempId,
        payload: &OutgoingPayload,
    ) -> Result<Message, TransportError>;
}

/// In-memory REST API for testing.
///
/// Serves history from a list of messages (oldest first) and appends
/// fallback sends to it. Page fetches can be held open to test
/// coalescing and teardown.
#[derive(Debug, Clone)]
pub struct MockRest {
    inner: Arc<Mutex<MockRestInner>>,
    gate: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Default)]
struct MockRestInner {
    history: Vec<Message>,
    sender: Option<UserId>,
    page_calls: Vec<(u32, usize)>,
    sent: Vec<(ClientTempId, OutgoingPayload)>,
    fail_next_page: Option<String>,
    fail_next_send: Option<String>,
    fail_sends: Option<String>,
}

impl Default for MockRest {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRest {
    /// Create an API with no history.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: Arc::default(),
            gate: Arc::new(gate),
        }
    }

    /// Seed history (oldest first).
    pub fn with_history(self, history: Vec<Message>) -> Self {
        self.lock().history = history;
        self
    }

    /// Attribute fallback sends to `sender`.
    pub fn with_sender(self, sender: UserId) -> Self {
        self.lock().sender = Some(sender);
        self
    }

    /// Append a message to the server-side history.
    pub fn push_history(&self, message: Message) {
        self.lock().history.push(message);
    }

    /// Make page fetches wait until [`MockRest::release_pages`].
    pub fn hold_pages(&self) {
        self.gate.send_replace(true);
    }

    /// Let held page fetches complete.
    pub fn release_pages(&self) {
        self.gate.send_replace(false);
    }

    /// `(page, page_size)` of every page fetch, in call order.
    pub fn page_calls(&self) -> Vec<(u32, usize)> {
        self.lock().page_calls.clone()
    }

    /// Every fallback send received.
    pub fn sent(&self) -> Vec<(ClientTempId, OutgoingPayload)> {
        self.lock().sent.clone()
    }

    /// Cause the next page fetch to fail.
    pub fn fail_next_page(&self, error: &str) {
        self.lock().fail_next_page = Some(error.to_string());
    }

    /// Cause the next fallback send to fail.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Make every fallback send fail until cleared with `None`.
    pub fn fail_sends(&self, error: Option<&str>) {
        self.lock().fail_sends = error.map(str::to_string);
    }

    fn lock(&self) -> MutexGuard<'_, MockRestInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RestApi for MockRest {
    async fn get_page(
        &self,
        _conversation: ConversationId,
        page: u32,
        page_size: usize,
    ) -> Result<HistoryPage, TransportError> {
        self.lock().page_calls.push((page, page_size));

        let mut gate = self.gate.subscribe();
        // The sender lives in self, so the gate cannot close under us
        let _ = gate.wait_for(|held| !*held).await;

        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_page.take() {
            return Err(TransportError::RequestFailed(error));
        }

        let total = inner.history.len();
        let skip = (page.max(1) as usize - 1).saturating_mul(page_size);
        let end = total.saturating_sub(skip);
        let start = end.saturating_sub(page_size);
        Ok(HistoryPage::new(
            inner.history[start..end].iter().rev().cloned().collect(),
            total as u64,
        ))
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        client_temp_id: ClientTempId,
        payload: &OutgoingPayload,
    ) -> Result<Message, TransportError> {
        let mut inner = self.lock();
        inner.sent.push((client_temp_id, payload.clone()));

        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::RequestFailed(error));
        }
        if let Some(error) = &inner.fail_sends {
            return Err(TransportError::RequestFailed(error.clone()));
        }

        let id = inner
            .history
            .iter()
            .filter_map(|m| m.id)
            .max()
            .map_or(1, |id| id.value() + 1);
        let mut message = Message::pending(
            client_temp_id,
            conversation,
            inner.sender.unwrap_or(UserId::new(0)),
            payload,
            Timestamp::now(),
        );
        message.id = Some(MessageId::new(id));
        inner.history.push(message.clone());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: u64) -> Vec<Message> {
        (1..=n)
            .map(|id| {
                Message::confirmed(
                    MessageId::new(id),
                    ConversationId::new(1),
                    UserId::new(2),
                    "x",
                    Timestamp::from_millis(id as i64 * 10),
                )
            })
            .collect()
    }

    fn ids(page: &HistoryPage) -> Vec<u64> {
        page.messages.iter().filter_map(|m| m.id).map(|id| id.value()).collect()
    }

    #[tokio::test]
    async fn pages_are_newest_first() {
        let rest = MockRest::new().with_history(history(5));
        let conv = ConversationId::new(1);

        let first = rest.get_page(conv, 1, 2).await.unwrap();
        let second = rest.get_page(conv, 2, 2).await.unwrap();
        let third = rest.get_page(conv, 3, 2).await.unwrap();
        let beyond = rest.get_page(conv, 4, 2).await.unwrap();

        assert_eq!(ids(&first), vec![5, 4]);
        assert_eq!(ids(&second), vec![3, 2]);
        assert_eq!(ids(&third), vec![1]);
        assert!(beyond.messages.is_empty());
        assert_eq!(first.total_count, 5);
        assert_eq!(rest.page_calls(), vec![(1, 2), (2, 2), (3, 2), (4, 2)]);
    }

    #[tokio::test]
    async fn fallback_send_assigns_next_id() {
        let rest = MockRest::new()
            .with_history(history(3))
            .with_sender(UserId::new(1));
        let temp = ClientTempId::new();

        let message = rest
            .send_message(ConversationId::new(1), temp, &OutgoingPayload::text("hi"))
            .await
            .unwrap();

        assert_eq!(message.id, Some(MessageId::new(4)));
        assert_eq!(message.client_temp_id, Some(temp));
        assert_eq!(message.sender_id, UserId::new(1));
        assert_eq!(rest.sent().len(), 1);
    }

    #[tokio::test]
    async fn forced_failures() {
        let rest = MockRest::new();
        rest.fail_next_page("502");
        rest.fail_next_send("503");

        assert!(rest.get_page(ConversationId::new(1), 1, 20).await.is_err());
        assert!(rest.get_page(ConversationId::new(1), 1, 20).await.is_ok());
        assert!(rest
            .send_message(ConversationId::new(1), ClientTempId::new(), &OutgoingPayload::text("a"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn held_pages_wait_for_release() {
        let rest = MockRest::new().with_history(history(1));
        rest.hold_pages();

        let fetch = {
            let rest = rest.clone();
            tokio::spawn(async move { rest.get_page(ConversationId::new(1), 1, 20).await })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!fetch.is_finished());
        assert_eq!(rest.page_calls().len(), 1);

        rest.release_pages();
        assert_eq!(fetch.await.unwrap().unwrap().messages.len(), 1);
    }
}
