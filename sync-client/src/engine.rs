//! ConversationSyncEngine - the object a renderer binds to.
//!
//! One engine owns the state of one open conversation. It runs as a single
//! tokio task (the actor) that is the only writer of that state; everything
//! else talks to it through messages:
//!
//! ```text
//! EngineHandle ──commands──▶ ┌──────────────┐ ──snapshots──▶ watch::Receiver
//! PushChannel  ──signals───▶ │ engine actor │ ──invoke────▶ writer task ─▶ PushChannel
//! RestApi      ──results───▶ └──────────────┘ ──fetch/send─▶ helper tasks ─▶ RestApi
//!                                   ▲
//!                              sync-core trackers + Timers
//! ```
//!
//! Helper tasks never touch the state directly; they post their results
//! back to the actor, which applies them in arrival order.
//!
//! # Example
//!
//! ```ignore
//! let engine = ConversationSyncEngine::spawn(
//!     Conversation::direct(conv, me, peer),
//!     me,
//!     channel,
//!     rest,
//!     MemoryKeyValueStore::shared(),
//!     EngineConfig::default(),
//! );
//!
//! let temp = engine.send(OutgoingPayload::text("hi")).await?;
//! let id = engine.delivery(temp).await?;
//! println!("{:?}", engine.snapshot().messages);
//! engine.close().await;
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use convo_sync_core::{
    Action, AckOutcome, CommandQueue, EngineState, Event, FallbackOutcome, FallbackRequest,
    LoadStep, MessageStore, OptimisticSendTracker, PageError, PageRequest, PaginationController,
    PresenceEntry, PresenceTracker, Queued, ReactionLedger, ReadReceipt, ReadReceiptTracker,
    SendError, SendStatus, SharedKeyValueStore, TimerKind, Timers, TypingCoordinator,
    UpsertOutcome,
};
use convo_sync_types::{
    wire, ChannelEvent, ClientTempId, Conversation, ConversationId, HistoryPage, Message,
    MessageId, OutboundCommand, OutgoingPayload, SyncError, Timestamp, UserId,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::rest::RestApi;
use crate::transport::{ChannelSignal, PushChannel, TransportError};

/// Capacity of the command mailbox.
const COMMAND_BUFFER: usize = 64;

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine was closed (explicitly or because every handle was dropped).
    #[error("engine closed")]
    Closed,

    /// A send failed or was discarded.
    #[error(transparent)]
    Send(#[from] SendError),

    /// A history load failed.
    #[error(transparent)]
    Page(#[from] PageError),

    /// No tracked send has this temp id.
    #[error("unknown send {0}")]
    UnknownSend(ClientTempId),

    /// Only failed sends can be retried.
    #[error("send {0} is not in a failed state")]
    NotRetryable(ClientTempId),

    /// The message is not loaded.
    #[error("message {0} is not loaded")]
    UnknownMessage(MessageId),

    /// Only the author can recall a message.
    #[error("message {0} was not sent by the local user")]
    NotAuthor(MessageId),
}

/// Delivery state of one message, as the renderer shows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// The server has the message.
    Confirmed,
    /// Waiting for the channel ack.
    Sending,
    /// The channel gave up; the REST fallback is in flight.
    RetryingViaFallback,
    /// Delivery failed; the user may retry or discard.
    Failed,
}

impl From<SendStatus> for Delivery {
    fn from(status: SendStatus) -> Self {
        match status {
            SendStatus::Sending => Self::Sending,
            SendStatus::RetryingViaFallback => Self::RetryingViaFallback,
            SendStatus::Failed => Self::Failed,
        }
    }
}

/// A message plus its delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    /// The message.
    #[serde(flatten)]
    pub message: Message,
    /// Where it is in delivery.
    pub delivery: Delivery,
}

/// Everything a renderer needs, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// The conversation.
    pub conversation: ConversationId,
    /// Lifecycle state.
    pub state: EngineState,
    /// Current participants, updated as users join and leave.
    pub participants: Vec<UserId>,
    /// Confirmed messages in order, then pending ones in send order.
    pub messages: Vec<MessageView>,
    /// Pinned messages, in display order.
    pub pinned: Vec<MessageId>,
    /// Peers currently typing.
    pub typing: Vec<UserId>,
    /// Presence of every participant seen so far.
    pub presence: Vec<PresenceEntry>,
    /// False until the first presence snapshot after (re)connecting.
    pub presence_known: bool,
    /// Messages from others newer than the local read receipt.
    pub unread: usize,
    /// Whether older history may exist.
    pub has_more: bool,
    /// Newest read message per participant.
    pub receipts: BTreeMap<UserId, ReadReceipt>,
}

impl Snapshot {
    fn initial(conversation: &Conversation) -> Self {
        Self {
            conversation: conversation.id,
            state: EngineState::new(),
            participants: conversation.participants.clone(),
            messages: Vec::new(),
            pinned: Vec::new(),
            typing: Vec::new(),
            presence: Vec::new(),
            presence_known: false,
            unread: 0,
            has_more: true,
            receipts: BTreeMap::new(),
        }
    }

    /// Ids of the confirmed messages, in display order.
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.messages.iter().filter_map(|v| v.message.id).collect()
    }

    /// Number of messages not yet confirmed.
    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|v| v.message.is_pending()).count()
    }

    /// Find a message by server id.
    pub fn message(&self, id: MessageId) -> Option<&MessageView> {
        self.messages.iter().find(|v| v.message.id == Some(id))
    }

    /// Find a message by the temp id of the send that created it.
    pub fn by_temp_id(&self, temp: ClientTempId) -> Option<&MessageView> {
        self.messages
            .iter()
            .find(|v| v.message.client_temp_id == Some(temp))
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Send {
        payload: OutgoingPayload,
        reply: Reply<ClientTempId>,
    },
    Delivery {
        temp: ClientTempId,
        reply: Reply<MessageId>,
    },
    LoadOlder {
        reply: Reply<usize>,
    },
    SetTyping {
        is_typing: bool,
        reply: Reply<()>,
    },
    MarkRead {
        reply: Reply<Option<MessageId>>,
    },
    React {
        message_id: MessageId,
        emoji: String,
        reply: Reply<bool>,
    },
    Recall {
        message_id: MessageId,
        reply: Reply<()>,
    },
    Delete {
        message_id: MessageId,
        reply: Reply<()>,
    },
    Retry {
        temp: ClientTempId,
        reply: Reply<()>,
    },
    Discard {
        temp: ClientTempId,
        reply: Reply<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Results posted back to the actor by its helper tasks.
enum Internal {
    Signal(ChannelSignal),
    ChannelClosed,
    Subscribed(Result<(), TransportError>),
    Page {
        request_id: u64,
        result: Result<HistoryPage, TransportError>,
    },
    Fallback {
        temp: ClientTempId,
        result: Result<Message, TransportError>,
    },
    TransmitFailed {
        temp: ClientTempId,
        attempt: u32,
        error: TransportError,
    },
}

struct Outbound {
    command: OutboundCommand,
    /// Set for sends, so a transmit failure can be matched to its attempt.
    origin: Option<(ClientTempId, u32)>,
}

/// Handle to a running engine.
///
/// Cheap to clone. The engine shuts down when [`EngineHandle::close`] is
/// called or when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    conversation: ConversationId,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl EngineHandle {
    /// The conversation this engine syncs.
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// Send a message optimistically.
    ///
    /// Returns as soon as the pending message is in the store; use
    /// [`EngineHandle::delivery`] to wait for the outcome.
    pub async fn send(&self, payload: OutgoingPayload) -> Result<ClientTempId, EngineError> {
        self.call(|reply| Command::Send { payload, reply }).await
    }

    /// Send a text message.
    pub async fn send_text(&self, text: &str) -> Result<ClientTempId, EngineError> {
        self.send(OutgoingPayload::text(text)).await
    }

    /// Wait until a send is confirmed (via the channel or the REST
    /// fallback) or fails.
    pub async fn delivery(&self, temp: ClientTempId) -> Result<MessageId, EngineError> {
        self.call(|reply| Command::Delivery { temp, reply }).await
    }

    /// Load the next older history page. Concurrent calls share one fetch.
    ///
    /// Returns the number of messages added.
    pub async fn load_older(&self) -> Result<usize, EngineError> {
        self.call(|reply| Command::LoadOlder { reply }).await
    }

    /// Report local input activity (`true`) or an explicit stop.
    pub async fn set_typing(&self, is_typing: bool) -> Result<(), EngineError> {
        self.call(|reply| Command::SetTyping { is_typing, reply })
            .await
    }

    /// Mark everything loaded as read.
    ///
    /// Returns the message the receipt moved to, or `None` if it was
    /// already there.
    pub async fn mark_read(&self) -> Result<Option<MessageId>, EngineError> {
        self.call(|reply| Command::MarkRead { reply }).await
    }

    /// Toggle the local user's reaction. Returns true if it was added.
    pub async fn react(&self, message_id: MessageId, emoji: &str) -> Result<bool, EngineError> {
        let emoji = emoji.to_string();
        self.call(|reply| Command::React {
            message_id,
            emoji,
            reply,
        })
        .await
    }

    /// Recall one of the local user's messages.
    pub async fn recall(&self, message_id: MessageId) -> Result<(), EngineError> {
        self.call(|reply| Command::Recall { message_id, reply })
            .await
    }

    /// Delete a message.
    pub async fn delete(&self, message_id: MessageId) -> Result<(), EngineError> {
        self.call(|reply| Command::Delete { message_id, reply })
            .await
    }

    /// Retry a failed send under the same temp id.
    pub async fn retry(&self, temp: ClientTempId) -> Result<(), EngineError> {
        self.call(|reply| Command::Retry { temp, reply }).await
    }

    /// Drop a pending send.
    pub async fn discard(&self, temp: ClientTempId) -> Result<(), EngineError> {
        self.call(|reply| Command::Discard { temp, reply }).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Shut the engine down and wait for teardown to finish.
    ///
    /// Closing an engine that is already closed is a no-op.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)?
    }
}

/// Entry point for starting conversation engines.
pub struct ConversationSyncEngine;

impl ConversationSyncEngine {
    /// Start an engine for `conversation` on the current tokio runtime.
    ///
    /// The engine immediately subscribes to the channel and fetches the
    /// newest history page; it becomes ready when both have finished.
    pub fn spawn<C, R>(
        conversation: Conversation,
        local_user: UserId,
        channel: C,
        rest: R,
        kv: SharedKeyValueStore,
        config: EngineConfig,
    ) -> EngineHandle
    where
        C: PushChannel + 'static,
        R: RestApi + 'static,
    {
        let conversation_id = conversation.id;
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (snapshots_tx, snapshots) = watch::channel(Snapshot::initial(&conversation));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(channel);
        let writer = tokio::spawn(write_outbound(
            Arc::clone(&channel),
            outbound_rx,
            internal_tx.clone(),
        ));

        let engine = Engine {
            local_user,
            channel,
            rest: Arc::new(rest),
            state: EngineState::new(),
            store: MessageStore::new(),
            outbox: OptimisticSendTracker::new(config.send_timeout()),
            pager: PaginationController::new(conversation_id, config.page_size, Arc::clone(&kv)),
            presence: PresenceTracker::new(kv),
            typing: TypingCoordinator::new(config.typing()),
            reactions: ReactionLedger::new(config.max_parked_reactions),
            receipts: ReadReceiptTracker::new(),
            timers: Timers::new(),
            queue: CommandQueue::new(config.command_queue_limit),
            conversation,
            initial_request: None,
            page_waiters: HashMap::new(),
            delivery_waiters: HashMap::new(),
            confirmed_sends: ConfirmedSends::new(config.confirmed_send_memory),
            close_timeout: config.close_timeout(),
            commands,
            internal_tx,
            internal_rx,
            outbound: Some(outbound_tx),
            writer: Some(writer),
            snapshots: snapshots_tx,
            tasks: Vec::new(),
        };
        tokio::spawn(engine.run());

        EngineHandle {
            conversation: conversation_id,
            commands: commands_tx,
            snapshots,
        }
    }
}

/// Temp id → server id of confirmed sends, oldest forgotten first.
struct ConfirmedSends {
    ids: HashMap<ClientTempId, MessageId>,
    order: VecDeque<ClientTempId>,
    capacity: usize,
}

impl ConfirmedSends {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, temp: &ClientTempId) -> Option<MessageId> {
        self.ids.get(temp).copied()
    }

    fn contains(&self, temp: &ClientTempId) -> bool {
        self.ids.contains_key(temp)
    }

    fn insert(&mut self, temp: ClientTempId, id: MessageId) {
        if self.ids.insert(temp, id).is_some() {
            return;
        }
        self.order.push_back(temp);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

struct Engine<C, R> {
    conversation: Conversation,
    local_user: UserId,
    channel: Arc<C>,
    rest: Arc<R>,

    state: EngineState,
    store: MessageStore,
    outbox: OptimisticSendTracker,
    pager: PaginationController,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    reactions: ReactionLedger,
    receipts: ReadReceiptTracker,
    timers: Timers,
    queue: CommandQueue,

    /// Request id of the first history page; its completion settles startup.
    initial_request: Option<u64>,
    page_waiters: HashMap<u64, Vec<Reply<usize>>>,
    delivery_waiters: HashMap<ClientTempId, Vec<Reply<MessageId>>>,
    /// Recently confirmed sends, for late delivery queries.
    confirmed_sends: ConfirmedSends,
    close_timeout: Duration,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    writer: Option<JoinHandle<()>>,
    snapshots: watch::Sender<Snapshot>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C, R> Engine<C, R>
where
    C: PushChannel + 'static,
    R: RestApi + 'static,
{
    async fn run(mut self) {
        info!(conversation = %self.conversation.id, "conversation engine started");
        self.start();

        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!(conversation = %self.conversation.id, "all handles dropped");
                        self.close().await;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                () = sleep_until(deadline) => self.fire_timers(),
            }

            self.publish();
            if self.state.is_closed() {
                break;
            }
        }
    }

    fn start(&mut self) {
        self.spawn_join();

        let channel = Arc::clone(&self.channel);
        let internal = self.internal_tx.clone();
        self.tasks.push(tokio::spawn(pump_signals(channel, internal)));

        if let LoadStep::Fetch(request) = self.pager.begin_load() {
            self.initial_request = Some(request.request_id);
            self.spawn_page(request);
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn transition(&mut self, event: Event) {
        let before = self.state;
        let (state, actions) = before.on_event(event);
        self.state = state;
        if before.name() != state.name() {
            info!(
                conversation = %self.conversation.id,
                from = %before,
                to = %state,
                "engine state changed"
            );
        }
        for action in actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::FlushQueue => self.flush_queue(),
            Action::RequestPresenceSnapshot => self.invoke(OutboundCommand::GetOnlineUsers, None),
            Action::InvalidatePresence => self.presence.mark_unknown(),
            Action::Teardown => self.release_local(),
        }
    }

    fn flush_queue(&mut self) {
        let queued = self.queue.drain();
        if !queued.is_empty() {
            debug!(conversation = %self.conversation.id, count = queued.len(), "flushing queued commands");
        }
        for item in queued {
            match item {
                Queued::Send(temp) => {
                    if self.outbox.status(&temp) == Some(SendStatus::Sending) {
                        self.transmit_send(temp);
                    }
                }
                Queued::Command(command) => self.invoke(command, None),
            }
        }
    }

    async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.transition(Event::CloseRequested);

        if let Some(outbound) = self.outbound.take() {
            if self.conversation.is_group() {
                let _ = outbound.send(Outbound {
                    command: OutboundCommand::LeaveGroup {
                        conversation_id: self.conversation.id,
                    },
                    origin: None,
                });
            }
        }
        // Let the writer drain what was already handed to it, but never
        // wait on a stalled channel past the close timeout
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(self.close_timeout, &mut writer)
                .await
                .is_err()
            {
                warn!(
                    conversation = %self.conversation.id,
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "outbound drain timed out, abandoning queued commands"
                );
                writer.abort();
            }
        }
        match tokio::time::timeout(self.close_timeout, self.channel.unsubscribe()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conversation = %self.conversation.id, error = %e, "unsubscribe failed")
            }
            Err(_) => warn!(conversation = %self.conversation.id, "unsubscribe timed out"),
        }
        info!(conversation = %self.conversation.id, "conversation engine closed");
    }

    /// Drop everything in-memory that could still produce work.
    fn release_local(&mut self) {
        self.pager.close();
        for waiter in self.page_waiters.drain().flat_map(|(_, w)| w) {
            let _ = waiter.send(Err(EngineError::Closed));
        }
        for waiter in self.delivery_waiters.drain().flat_map(|(_, w)| w) {
            let _ = waiter.send(Err(EngineError::Closed));
        }
        self.outbox.clear(&mut self.timers);
        self.typing.clear(&mut self.timers);
        self.queue.clear();
        self.reactions.clear();
        self.timers.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { payload, reply } => {
                let _ = reply.send(Ok(self.send(payload)));
            }
            Command::Delivery { temp, reply } => self.await_delivery(temp, reply),
            Command::LoadOlder { reply } => self.load_older(reply),
            Command::SetTyping { is_typing, reply } => {
                self.set_typing(is_typing);
                let _ = reply.send(Ok(()));
            }
            Command::MarkRead { reply } => {
                let _ = reply.send(Ok(self.mark_read()));
            }
            Command::React {
                message_id,
                emoji,
                reply,
            } => {
                let _ = reply.send(self.react(message_id, &emoji));
            }
            Command::Recall { message_id, reply } => {
                let _ = reply.send(self.recall(message_id));
            }
            Command::Delete { message_id, reply } => {
                let _ = reply.send(self.delete(message_id));
            }
            Command::Retry { temp, reply } => {
                let _ = reply.send(self.retry(temp));
            }
            Command::Discard { temp, reply } => {
                let _ = reply.send(self.discard(temp));
            }
            Command::Close { reply } => {
                self.close().await;
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    fn send(&mut self, payload: OutgoingPayload) -> ClientTempId {
        let now = now();
        let created_at = Timestamp::now();
        let temp = self
            .outbox
            .send(payload.clone(), created_at, now, &mut self.timers);
        self.store.append(Message::pending(
            temp,
            self.conversation.id,
            self.local_user,
            &payload,
            created_at,
        ));

        // Sending ends the local typing burst
        if let Some(is_typing) = self.typing.local_typing_changed(false, now, &mut self.timers) {
            self.emit(self.typing_command(is_typing));
        }

        self.transmit_send(temp);
        temp
    }

    fn transmit_send(&mut self, temp: ClientTempId) {
        if !self.state.is_ready() {
            debug!(client_temp_id = %temp, state = %self.state, "deferring send until ready");
            self.queue.defer_send(temp);
            return;
        }
        let Some(send) = self.outbox.get(&temp) else {
            return;
        };
        let command = OutboundCommand::SendMessage {
            conversation_id: self.conversation.id,
            client_temp_id: temp,
            payload: send.payload.clone(),
        };
        let origin = Some((temp, send.attempt));
        self.invoke(command, origin);
    }

    fn await_delivery(&mut self, temp: ClientTempId, reply: Reply<MessageId>) {
        if let Some(id) = self.confirmed_sends.get(&temp) {
            let _ = reply.send(Ok(id));
            return;
        }
        match self.outbox.get(&temp) {
            None => {
                let _ = reply.send(Err(EngineError::UnknownSend(temp)));
            }
            Some(send) if send.status == SendStatus::Failed => {
                let error = send
                    .error
                    .clone()
                    .unwrap_or_else(|| SendError::SendFailed("unknown".into()));
                let _ = reply.send(Err(error.into()));
            }
            Some(_) => self.delivery_waiters.entry(temp).or_default().push(reply),
        }
    }

    fn resolve_delivery(&mut self, temp: ClientTempId, result: Result<MessageId, EngineError>) {
        for waiter in self.delivery_waiters.remove(&temp).into_iter().flatten() {
            let _ = waiter.send(result.clone());
        }
    }

    fn load_older(&mut self, reply: Reply<usize>) {
        match self.pager.begin_load() {
            LoadStep::Closed => {
                let _ = reply.send(Err(EngineError::Closed));
            }
            LoadStep::Exhausted => {
                let _ = reply.send(Ok(0));
            }
            LoadStep::Join(request_id) => {
                debug!(request_id, "joining in-flight history load");
                self.page_waiters.entry(request_id).or_default().push(reply);
            }
            LoadStep::Fetch(request) => {
                self.page_waiters
                    .entry(request.request_id)
                    .or_default()
                    .push(reply);
                self.spawn_page(request);
            }
        }
    }

    fn set_typing(&mut self, is_typing: bool) {
        if let Some(state) = self
            .typing
            .local_typing_changed(is_typing, now(), &mut self.timers)
        {
            self.emit(self.typing_command(state));
        }
    }

    fn mark_read(&mut self) -> Option<MessageId> {
        let newest = self.store.newest_ref()?.id;
        if !self.receipts.should_mark_read(self.local_user, newest) {
            return None;
        }
        self.receipts
            .advance(self.local_user, newest, Timestamp::now());
        self.emit(OutboundCommand::MarkRead {
            conversation_id: self.conversation.id,
            message_id: newest,
        });
        Some(newest)
    }

    fn react(&mut self, message_id: MessageId, emoji: &str) -> Result<bool, EngineError> {
        let add = self
            .reactions
            .toggle(&mut self.store, message_id, self.local_user, emoji)
            .ok_or(EngineError::UnknownMessage(message_id))?;
        self.emit(OutboundCommand::React {
            message_id,
            emoji: emoji.to_string(),
            add,
        });
        Ok(add)
    }

    fn recall(&mut self, message_id: MessageId) -> Result<(), EngineError> {
        let message = self
            .store
            .get(message_id)
            .ok_or(EngineError::UnknownMessage(message_id))?;
        if message.sender_id != self.local_user {
            return Err(EngineError::NotAuthor(message_id));
        }
        self.store.mark_recalled(message_id);
        self.emit(OutboundCommand::Recall { message_id });
        Ok(())
    }

    fn delete(&mut self, message_id: MessageId) -> Result<(), EngineError> {
        self.store
            .remove(message_id)
            .ok_or(EngineError::UnknownMessage(message_id))?;
        self.reactions.forget(message_id);
        self.emit(OutboundCommand::Delete { message_id });
        Ok(())
    }

    fn retry(&mut self, temp: ClientTempId) -> Result<(), EngineError> {
        if self.outbox.retry(&temp, now(), &mut self.timers).is_none() {
            return Err(match self.outbox.get(&temp) {
                Some(_) => EngineError::NotRetryable(temp),
                None => EngineError::UnknownSend(temp),
            });
        }
        self.transmit_send(temp);
        Ok(())
    }

    fn discard(&mut self, temp: ClientTempId) -> Result<(), EngineError> {
        self.outbox
            .discard(&temp, &mut self.timers)
            .ok_or(EngineError::UnknownSend(temp))?;
        self.store.remove_pending(&temp);
        self.queue.cancel_send(&temp);
        info!(client_temp_id = %temp, "pending send discarded");
        self.resolve_delivery(temp, Err(SendError::Discarded.into()));
        Ok(())
    }

    // =========================================================================
    // Helper task results
    // =========================================================================

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Signal(signal) => self.handle_signal(signal),
            Internal::ChannelClosed => {
                warn!(conversation = %self.conversation.id, "push channel closed");
                self.transition(Event::ChannelLost);
            }
            Internal::Subscribed(Ok(())) => {
                debug!(conversation = %self.conversation.id, "channel subscription established");
                self.transition(Event::Joined);
            }
            Internal::Subscribed(Err(e)) => {
                error!(conversation = %self.conversation.id, error = %e, "channel subscribe failed");
                self.transition(Event::ChannelLost);
            }
            Internal::Page { request_id, result } => self.handle_page(request_id, result),
            Internal::Fallback { temp, result } => self.handle_fallback(temp, result),
            Internal::TransmitFailed {
                temp,
                attempt,
                error,
            } => {
                // A failure for an earlier attempt says nothing about this one
                if self.outbox.get(&temp).map(|s| s.attempt) != Some(attempt) {
                    return;
                }
                if let Some(request) =
                    self.outbox
                        .on_failure(&temp, &error.to_string(), &mut self.timers)
                {
                    self.spawn_fallback(request);
                }
            }
        }
    }

    fn handle_signal(&mut self, signal: ChannelSignal) {
        match signal {
            ChannelSignal::Event { name, payload } => {
                match wire::parse_event(self.conversation.id, &name, &payload) {
                    Ok(event) => self.apply_event(event),
                    Err(SyncError::UnknownEvent(name)) => {
                        debug!(event = %name, "ignoring unknown channel event");
                    }
                    Err(e) => warn!(event = %name, error = %e, "skipping malformed channel event"),
                }
            }
            ChannelSignal::Disconnected { reason } => {
                warn!(conversation = %self.conversation.id, %reason, "push channel disconnected");
                self.transition(Event::ChannelLost);
            }
            ChannelSignal::Reconnected => {
                info!(conversation = %self.conversation.id, "push channel reconnected");
                // Group membership does not survive a reconnect; neither
                // does a subscription that never completed
                let needs_join =
                    matches!(self.state, EngineState::Connecting { .. }) || self.conversation.is_group();
                if needs_join {
                    self.spawn_join();
                } else {
                    self.transition(Event::ChannelRestored);
                }
            }
        }
    }

    fn handle_page(&mut self, request_id: u64, result: Result<HistoryPage, TransportError>) {
        // Per-message bookkeeping the store does not keep
        let arrived: Vec<(MessageId, Timestamp, Vec<UserId>)> = result
            .as_ref()
            .map(|page| {
                page.messages
                    .iter()
                    .filter_map(|m| {
                        m.id.map(|id| (id, m.created_at, m.read_by.iter().copied().collect()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let outcome = self.pager.complete(
            request_id,
            result.map_err(|e| e.to_string()),
            &mut self.store,
        );
        match &outcome {
            Ok(_) => {
                for (id, created_at, readers) in arrived {
                    self.reactions.on_message_inserted(&mut self.store, id);
                    for reader in readers {
                        self.receipts.advance(reader, id, created_at);
                    }
                }
            }
            Err(PageError::Stale) => return,
            Err(e) => warn!(conversation = %self.conversation.id, error = %e, "history load failed"),
        }

        for waiter in self.page_waiters.remove(&request_id).into_iter().flatten() {
            let _ = waiter.send(outcome.clone().map_err(EngineError::from));
        }
        if self.initial_request == Some(request_id) {
            self.initial_request = None;
            self.transition(Event::InitialPageSettled);
        }
    }

    fn handle_fallback(&mut self, temp: ClientTempId, result: Result<Message, TransportError>) {
        match result {
            Ok(message) => {
                let outcome = self
                    .outbox
                    .on_fallback_result(&temp, Ok(()), &mut self.timers);
                let id = message.id;
                self.accept_message(message.with_client_temp_id(temp));
                match (outcome, id) {
                    (FallbackOutcome::Confirmed, Some(id)) => {
                        info!(client_temp_id = %temp, message_id = %id, "message delivered via REST fallback");
                        self.resolve_delivery(temp, Ok(id));
                    }
                    _ => debug!(client_temp_id = %temp, "fallback result after send resolved"),
                }
            }
            Err(e) => {
                let outcome =
                    self.outbox
                        .on_fallback_result(&temp, Err(e.to_string()), &mut self.timers);
                if let FallbackOutcome::Failed(error) = outcome {
                    if let Some(id) = self.confirmed_sends.get(&temp) {
                        // The channel echo already landed while the fallback
                        // was in flight
                        self.outbox.discard(&temp, &mut self.timers);
                        self.resolve_delivery(temp, Ok(id));
                    } else {
                        self.resolve_delivery(temp, Err(error.into()));
                    }
                }
            }
        }
    }

    // =========================================================================
    // Channel events
    // =========================================================================

    fn apply_event(&mut self, event: ChannelEvent) {
        debug!(event = event.name(), "channel event");
        let now = now();
        match event {
            ChannelEvent::MessageReceived { message } => {
                if message.conversation_id != self.conversation.id {
                    debug!(conversation = %message.conversation_id, "message for another conversation ignored");
                    return;
                }
                let temp = message.client_temp_id;
                let id = message.id;
                let confirmed = match temp {
                    Some(temp) => self.outbox.on_ack(&temp, &mut self.timers) == AckOutcome::Confirmed,
                    None => false,
                };
                self.accept_message(message);
                if let (true, Some(temp), Some(id)) = (confirmed, temp, id) {
                    self.queue.cancel_send(&temp);
                    self.resolve_delivery(temp, Ok(id));
                }
            }
            ChannelEvent::MessageSentAck {
                client_temp_id: temp,
                message,
            } => {
                if self.confirmed_sends.contains(&temp) {
                    debug!(client_temp_id = %temp, "ack for already confirmed send ignored");
                    return;
                }
                let id = message.id;
                match self.outbox.on_ack(&temp, &mut self.timers) {
                    AckOutcome::Stale => {}
                    AckOutcome::Confirmed => {
                        self.queue.cancel_send(&temp);
                        self.accept_message(message.with_client_temp_id(temp));
                        if let Some(id) = id {
                            self.resolve_delivery(temp, Ok(id));
                        }
                    }
                    AckOutcome::Unknown => self.accept_message(message.with_client_temp_id(temp)),
                }
            }
            ChannelEvent::MessageSaveFailed {
                client_temp_id: temp,
                reason,
            } => {
                if let Some(error) = self.outbox.on_save_failed(&temp, &reason, &mut self.timers) {
                    self.queue.cancel_send(&temp);
                    self.resolve_delivery(temp, Err(error.into()));
                }
            }
            ChannelEvent::Typing { user_id, is_typing } => {
                if user_id != self.local_user {
                    self.typing
                        .peer_typing(user_id, is_typing, now, &mut self.timers);
                }
            }
            ChannelEvent::PresenceSnapshot { online } => self.presence.apply_snapshot(&online),
            ChannelEvent::UserOnline { user_id } => self.presence.set_online(user_id),
            ChannelEvent::UserOffline { user_id, last_seen } => {
                self.presence.set_offline(user_id, last_seen)
            }
            ChannelEvent::ReactionAdded {
                message_id,
                user_id,
                emoji,
            } => {
                self.reactions
                    .add_reaction(&mut self.store, message_id, user_id, &emoji);
            }
            ChannelEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            } => {
                self.reactions
                    .remove_reaction(&mut self.store, message_id, user_id, &emoji);
            }
            ChannelEvent::ReactionsReplaced {
                message_id,
                reactions,
            } => {
                self.reactions
                    .replace(&mut self.store, message_id, reactions);
            }
            ChannelEvent::MessageRead {
                user_id,
                message_id,
                read_at,
            } => {
                self.receipts.advance(user_id, message_id, read_at);
                self.store.add_read_by(message_id, user_id);
            }
            ChannelEvent::MessageRecalled { message_id } => {
                self.store.mark_recalled(message_id);
            }
            ChannelEvent::MessageDeleted { message_id } => {
                self.store.remove(message_id);
                self.reactions.forget(message_id);
            }
            ChannelEvent::MessagePinned {
                message_id,
                pinned,
                by,
            } => {
                if !self.store.contains(message_id) {
                    // History pages carry the pin state for older messages
                    debug!(message_id = %message_id, "pin change for unloaded message ignored");
                } else if self.store.set_pinned(message_id, pinned) {
                    debug!(message_id = %message_id, pinned, by = ?by, "pin state changed");
                }
            }
            ChannelEvent::ParticipantJoined { user_id } => {
                if !self.conversation.participants.contains(&user_id) {
                    self.conversation.participants.push(user_id);
                    info!(conversation = %self.conversation.id, user = %user_id, "participant joined");
                }
            }
            ChannelEvent::ParticipantLeft { user_id } => {
                let before = self.conversation.participants.len();
                self.conversation.participants.retain(|u| *u != user_id);
                if self.conversation.participants.len() != before {
                    info!(conversation = %self.conversation.id, user = %user_id, "participant left");
                }
                self.typing.peer_typing(user_id, false, now, &mut self.timers);
            }
        }
    }

    /// Put a confirmed message into the store and update what hangs off it.
    fn accept_message(&mut self, message: Message) {
        let Some(id) = message.id else {
            return;
        };
        let temp = message.client_temp_id;
        let sender = message.sender_id;
        let created_at = message.created_at;
        let readers: Vec<UserId> = message.read_by.iter().copied().collect();

        match self.store.upsert_by_temp_or_id(message) {
            UpsertOutcome::Inserted | UpsertOutcome::Reconciled => {
                self.reactions.on_message_inserted(&mut self.store, id);
                if let Some(temp) = temp {
                    self.confirmed_sends.insert(temp, id);
                }
            }
            UpsertOutcome::Duplicate => {
                debug!(message_id = %id, "duplicate message ignored");
            }
            UpsertOutcome::Rejected => return,
        }

        for reader in readers {
            self.receipts.advance(reader, id, created_at);
        }
        // A peer's message ends their typing burst
        if sender != self.local_user {
            self.typing
                .peer_typing(sender, false, now(), &mut self.timers);
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn fire_timers(&mut self) {
        let now = now();
        for (_, kind) in self.timers.pop_expired(now) {
            match kind {
                TimerKind::SendTimeout(temp) => {
                    if let Some(request) = self.outbox.on_timeout(&temp) {
                        self.queue.cancel_send(&temp);
                        self.spawn_fallback(request);
                    }
                }
                TimerKind::TypingRebroadcast => {
                    if let Some(is_typing) =
                        self.typing.on_rebroadcast_timer(now, &mut self.timers)
                    {
                        self.emit(self.typing_command(is_typing));
                    }
                }
                TimerKind::TypingExpiry => {
                    self.typing.on_expiry_timer(now, &mut self.timers);
                }
            }
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn typing_command(&self, is_typing: bool) -> OutboundCommand {
        OutboundCommand::SetTyping {
            conversation_id: self.conversation.id,
            is_typing,
        }
    }

    /// Invoke now if ready, otherwise hold the command back.
    fn emit(&mut self, command: OutboundCommand) {
        if self.state.is_ready() {
            self.invoke(command, None);
        } else {
            self.queue.push(command);
        }
    }

    fn invoke(&mut self, command: OutboundCommand, origin: Option<(ClientTempId, u32)>) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        debug!(command = command.name(), "invoking");
        let _ = outbound.send(Outbound { command, origin });
    }

    fn spawn_join(&mut self) {
        let channel = Arc::clone(&self.channel);
        let internal = self.internal_tx.clone();
        let conversation = self.conversation.id;
        let group = self.conversation.is_group();
        self.tasks.push(tokio::spawn(async move {
            let mut result = channel.subscribe(conversation).await;
            if result.is_ok() && group {
                result = channel
                    .invoke(OutboundCommand::JoinGroup {
                        conversation_id: conversation,
                    })
                    .await;
            }
            let _ = internal.send(Internal::Subscribed(result));
        }));
    }

    fn spawn_page(&mut self, request: PageRequest) {
        let rest = Arc::clone(&self.rest);
        let internal = self.internal_tx.clone();
        let conversation = self.conversation.id;
        self.tasks.push(tokio::spawn(async move {
            let result = rest
                .get_page(conversation, request.page, request.page_size)
                .await;
            let _ = internal.send(Internal::Page {
                request_id: request.request_id,
                result,
            });
        }));
    }

    fn spawn_fallback(&mut self, request: FallbackRequest) {
        let rest = Arc::clone(&self.rest);
        let internal = self.internal_tx.clone();
        let conversation = self.conversation.id;
        self.tasks.push(tokio::spawn(async move {
            let result = rest
                .send_message(conversation, request.client_temp_id, &request.payload)
                .await;
            let _ = internal.send(Internal::Fallback {
                temp: request.client_temp_id,
                result,
            });
        }));
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    fn publish(&mut self) {
        self.tasks.retain(|task| !task.is_finished());
        let snapshot = self.build_snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn build_snapshot(&mut self) -> Snapshot {
        let typing = self.typing.typing_peers(now());
        let messages = self
            .store
            .iter()
            .map(|message| MessageView {
                delivery: match (message.id, message.client_temp_id) {
                    (Some(_), _) => Delivery::Confirmed,
                    (None, Some(temp)) => self
                        .outbox
                        .status(&temp)
                        .map_or(Delivery::Sending, Delivery::from),
                    (None, None) => Delivery::Sending,
                },
                message: message.clone(),
            })
            .collect();

        Snapshot {
            conversation: self.conversation.id,
            state: self.state,
            participants: self.conversation.participants.clone(),
            messages,
            pinned: self.store.pinned_ids(),
            typing,
            presence: self.presence.entries(),
            presence_known: self.presence.is_known(),
            unread: self.receipts.unread_count_for(self.local_user, &self.store),
            has_more: self.pager.has_more(),
            receipts: self.receipts.all().clone(),
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn pump_signals<C: PushChannel>(channel: Arc<C>, internal: mpsc::UnboundedSender<Internal>) {
    loop {
        let next = match channel.recv().await {
            Ok(signal) => Internal::Signal(signal),
            Err(TransportError::ConnectionClosed) => {
                let _ = internal.send(Internal::ChannelClosed);
                return;
            }
            Err(e) => Internal::Signal(ChannelSignal::Disconnected {
                reason: e.to_string(),
            }),
        };
        if internal.send(next).is_err() {
            return;
        }
    }
}

/// Invokes commands one at a time so the channel sees them in order.
async fn write_outbound<C: PushChannel>(
    channel: Arc<C>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    while let Some(Outbound { command, origin }) = outbound.recv().await {
        let name = command.name();
        if let Err(error) = channel.invoke(command).await {
            match origin {
                Some((temp, attempt)) => {
                    let _ = internal.send(Internal::TransmitFailed {
                        temp,
                        attempt,
                        error,
                    });
                }
                None => warn!(command = name, %error, "channel invoke failed"),
            }
        }
    }
}
