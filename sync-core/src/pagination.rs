//! History pagination.
//!
//! Pages come from the REST API newest-first: page 1 is the newest page and
//! doubles as the initial load. The controller hands out at most one
//! request at a time, tags it with a request id, and refuses results whose
//! id does not match (superseded or closed).

use convo_sync_types::{ConversationId, HistoryPage};
use thiserror::Error;

use crate::kv::{KeyValueStore, SharedKeyValueStore};
use crate::store::MessageStore;

/// A history fetch the driver should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Tag to hand back to [`PaginationController::complete`].
    pub request_id: u64,
    /// 1-based page number, newest first.
    pub page: u32,
    /// Requested page size.
    pub page_size: usize,
}

/// What [`PaginationController::begin_load`] wants the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    /// The controller is closed.
    Closed,
    /// No older history exists.
    Exhausted,
    /// A fetch is already in flight; wait for it.
    Join(u64),
    /// Start this fetch.
    Fetch(PageRequest),
}

/// Pagination failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// Result for a request that was superseded or arrived after close.
    #[error("stale page response")]
    Stale,

    /// The REST call failed. Nothing was applied.
    #[error("page fetch failed: {0}")]
    FetchFailed(String),

    /// The conversation was closed before the load could start.
    #[error("pagination closed")]
    Closed,
}

/// Loads older pages into a [`MessageStore`].
pub struct PaginationController {
    conversation: ConversationId,
    page_size: usize,
    next_page: u32,
    has_more: bool,
    in_flight: Option<PageRequest>,
    next_request_id: u64,
    closed: bool,
    kv: SharedKeyValueStore,
}

impl std::fmt::Debug for PaginationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginationController")
            .field("conversation", &self.conversation)
            .field("next_page", &self.next_page)
            .field("has_more", &self.has_more)
            .field("in_flight", &self.in_flight)
            .field("closed", &self.closed)
            .finish()
    }
}

impl PaginationController {
    /// Create a controller positioned before page 1.
    pub fn new(conversation: ConversationId, page_size: usize, kv: SharedKeyValueStore) -> Self {
        Self {
            conversation,
            page_size: page_size.max(1),
            next_page: 1,
            has_more: true,
            in_flight: None,
            next_request_id: 0,
            closed: false,
            kv,
        }
    }

    /// Ask for the next older page.
    ///
    /// Calls made while a fetch is in flight join it instead of issuing a
    /// second network call.
    pub fn begin_load(&mut self) -> LoadStep {
        if self.closed {
            return LoadStep::Closed;
        }
        if let Some(req) = self.in_flight {
            return LoadStep::Join(req.request_id);
        }
        if !self.has_more {
            return LoadStep::Exhausted;
        }
        self.next_request_id += 1;
        let req = PageRequest {
            request_id: self.next_request_id,
            page: self.next_page,
            page_size: self.page_size,
        };
        self.in_flight = Some(req);
        tracing::debug!(conversation = %self.conversation, page = req.page, request_id = req.request_id, "fetching history page");
        LoadStep::Fetch(req)
    }

    /// Apply the result of a fetch.
    ///
    /// Returns the number of messages actually inserted. Failures leave the
    /// store, the page number, and `has_more` untouched so the load can be
    /// retried.
    pub fn complete(
        &mut self,
        request_id: u64,
        result: Result<HistoryPage, String>,
        store: &mut MessageStore,
    ) -> Result<usize, PageError> {
        match self.in_flight {
            Some(req) if !self.closed && req.request_id == request_id => {}
            _ => {
                tracing::debug!(conversation = %self.conversation, request_id, "dropping stale page response");
                return Err(PageError::Stale);
            }
        }
        self.in_flight = None;

        let page = result.map_err(PageError::FetchFailed)?;
        // Rows the wire layer rejected still count toward a full page
        let returned = page.returned.max(page.messages.len());
        let inserted = store.prepend_page(page.messages);
        self.next_page += 1;

        self.kv
            .put(&total_key(self.conversation), page.total_count.to_string());

        let short = returned < self.page_size;
        let caught_up = store.confirmed_len() as u64 >= page.total_count;
        if short || caught_up {
            self.has_more = false;
        }
        tracing::debug!(
            conversation = %self.conversation,
            returned,
            inserted,
            total = page.total_count,
            has_more = self.has_more,
            "history page applied"
        );
        Ok(inserted)
    }

    /// Invalidate any in-flight request and refuse further loads.
    pub fn close(&mut self) {
        self.closed = true;
        self.in_flight = None;
    }

    /// Whether older history may exist.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether a fetch is outstanding.
    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Page number the next fetch will request.
    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    /// Last total message count reported by the server, if any.
    pub fn known_total(&self) -> Option<u64> {
        self.kv
            .get(&total_key(self.conversation))
            .and_then(|v| v.parse().ok())
    }
}

fn total_key(conversation: ConversationId) -> String {
    format!("history.total.{conversation}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;
    use convo_sync_types::{Message, MessageId, Timestamp, UserId};
    use std::sync::Arc;

    fn conv() -> ConversationId {
        ConversationId::new(7)
    }

    fn msg(id: u64) -> Message {
        Message::confirmed(
            MessageId::new(id),
            conv(),
            UserId::new(2),
            "x",
            Timestamp::from_millis(id as i64 * 10),
        )
    }

    /// Newest-first page of ids `from` down to `to`.
    fn page(ids: std::ops::RangeInclusive<u64>, total: u64) -> HistoryPage {
        HistoryPage::new(ids.rev().map(msg).collect(), total)
    }

    fn controller(page_size: usize) -> PaginationController {
        PaginationController::new(conv(), page_size, MemoryKeyValueStore::shared())
    }

    fn fetch(step: LoadStep) -> PageRequest {
        match step {
            LoadStep::Fetch(req) => req,
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    #[test]
    fn initial_load_is_page_one() {
        let mut pager = controller(3);
        let mut store = MessageStore::new();

        let req = fetch(pager.begin_load());
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, 3);

        let inserted = pager.complete(req.request_id, Ok(page(8..=10, 10)), &mut store).unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(pager.next_page(), 2);
        assert!(pager.has_more());
    }

    #[test]
    fn concurrent_loads_are_coalesced() {
        let mut pager = controller(3);
        let req = fetch(pager.begin_load());

        assert_eq!(pager.begin_load(), LoadStep::Join(req.request_id));
        assert_eq!(pager.begin_load(), LoadStep::Join(req.request_id));
    }

    #[test]
    fn short_page_ends_history() {
        let mut pager = controller(3);
        let mut store = MessageStore::new();
        let req = fetch(pager.begin_load());

        pager.complete(req.request_id, Ok(page(1..=2, 50)), &mut store).unwrap();

        assert!(!pager.has_more());
        assert_eq!(pager.begin_load(), LoadStep::Exhausted);
    }

    #[test]
    fn full_page_with_rejected_rows_keeps_history_open() {
        let mut pager = controller(20);
        let mut store = MessageStore::new();
        let req = fetch(pager.begin_load());

        // The server sent 20 rows, one of which failed normalization
        let mut partial = page(82..=100, 100);
        partial.returned = 20;
        pager.complete(req.request_id, Ok(partial), &mut store).unwrap();

        assert_eq!(store.confirmed_len(), 19);
        assert!(pager.has_more());
        assert_eq!(fetch(pager.begin_load()).page, 2);
    }

    #[test]
    fn reaching_total_ends_history() {
        let mut pager = controller(3);
        let mut store = MessageStore::new();
        let req = fetch(pager.begin_load());

        pager.complete(req.request_id, Ok(page(1..=3, 3)), &mut store).unwrap();

        assert!(!pager.has_more());
    }

    #[test]
    fn failure_keeps_position_for_retry() {
        let mut pager = controller(3);
        let mut store = MessageStore::new();
        let req = fetch(pager.begin_load());

        let err = pager
            .complete(req.request_id, Err("timeout".into()), &mut store)
            .unwrap_err();
        assert_eq!(err, PageError::FetchFailed("timeout".into()));
        assert!(pager.has_more());
        assert!(store.is_empty());

        let retry = fetch(pager.begin_load());
        assert_eq!(retry.page, 1);
        assert_ne!(retry.request_id, req.request_id);
    }

    #[test]
    fn result_after_close_is_stale() {
        let mut pager = controller(3);
        let mut store = MessageStore::new();
        let req = fetch(pager.begin_load());

        pager.close();

        let err = pager
            .complete(req.request_id, Ok(page(1..=3, 3)), &mut store)
            .unwrap_err();
        assert_eq!(err, PageError::Stale);
        assert!(store.is_empty());
        assert_eq!(pager.begin_load(), LoadStep::Closed);
    }

    #[test]
    fn mismatched_request_id_is_stale() {
        let mut pager = controller(3);
        let mut store = MessageStore::new();
        let req = fetch(pager.begin_load());

        assert_eq!(
            pager.complete(req.request_id + 1, Ok(page(1..=3, 9)), &mut store),
            Err(PageError::Stale)
        );
        // The real response still lands
        assert_eq!(pager.complete(req.request_id, Ok(page(1..=3, 9)), &mut store), Ok(3));
    }

    #[test]
    fn overlapping_page_is_deduplicated() {
        let mut pager = controller(2);
        let mut store = MessageStore::new();
        let first = fetch(pager.begin_load());
        pager.complete(first.request_id, Ok(page(1..=2, 10)), &mut store).unwrap();

        // A live message shifted the server offsets; m1 shows up again
        let second = fetch(pager.begin_load());
        let inserted = pager
            .complete(
                second.request_id,
                Ok(HistoryPage::new(vec![msg(1), msg(0)], 11)),
                &mut store,
            )
            .unwrap();

        assert_eq!(inserted, 1);
        let ids: Vec<u64> = store.iter().filter_map(|m| m.id).map(|id| id.value()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn total_is_cached_in_kv() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let mut pager = PaginationController::new(conv(), 3, kv.clone());
        let mut store = MessageStore::new();
        assert_eq!(pager.known_total(), None);

        let req = fetch(pager.begin_load());
        pager.complete(req.request_id, Ok(page(8..=10, 42)), &mut store).unwrap();

        assert_eq!(pager.known_total(), Some(42));
        assert_eq!(kv.get("history.total.7").as_deref(), Some("42"));
    }
}
