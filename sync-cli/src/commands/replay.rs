//! Replay a scripted session against mock collaborators.
//!
//! A script seeds the server-side history, then drives the engine through
//! a list of steps: local commands (send, react, ...) and simulated hub
//! traffic (events, disconnects). The report holds the final snapshot plus
//! any step that failed.
//!
//! ```json
//! {
//!   "conversation": { "id": 1, "participants": [1, 2] },
//!   "local_user": 1,
//!   "history": [{ "id": 1, "senderId": 2, "content": "hey", "createdAt": 10 }],
//!   "steps": [
//!     { "step": "send", "text": "hi", "wait": true },
//!     { "step": "event", "name": "UserTyping", "payload": { "userId": 2 } }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use convo_sync_client::{
    ConversationSyncEngine, Delivery, EngineConfig, EngineHandle, MockChannel, MockRest, Snapshot,
};
use convo_sync_core::MemoryKeyValueStore;
use convo_sync_types::{wire, ClientTempId, Conversation, ConversationId, Message, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// How long to wait for the engine to finish connecting.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after each step so channel traffic is applied before the next one.
const SETTLE: Duration = Duration::from_millis(20);

/// A scripted session.
#[derive(Debug, Deserialize)]
pub struct Script {
    /// Conversation to open.
    pub conversation: ScriptConversation,
    /// The user the engine acts as.
    pub local_user: u64,
    /// Server-side history, as raw REST payloads (any order).
    #[serde(default)]
    pub history: Value,
    /// Whether the mock hub acknowledges sends.
    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,
    /// Steps to run, in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_auto_ack() -> bool {
    true
}

/// Conversation description in a script.
#[derive(Debug, Deserialize)]
pub struct ScriptConversation {
    /// Conversation id.
    pub id: u64,
    /// Group conversation (otherwise direct).
    #[serde(default)]
    pub group: bool,
    /// Participant ids; exactly two for a direct conversation.
    pub participants: Vec<u64>,
}

impl ScriptConversation {
    fn build(&self) -> Result<Conversation> {
        let id = ConversationId::new(self.id);
        let participants: Vec<UserId> = self.participants.iter().copied().map(UserId::new).collect();
        if self.group {
            return Ok(Conversation::group(id, participants));
        }
        match participants.as_slice() {
            [a, b] => Ok(Conversation::direct(id, *a, *b)),
            _ => anyhow::bail!(
                "A direct conversation needs exactly 2 participants, got {}",
                participants.len()
            ),
        }
    }
}

/// One scripted action.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Send a text message, optionally waiting for its delivery.
    Send {
        /// Message text.
        text: String,
        /// Wait until the send is confirmed or fails.
        #[serde(default)]
        wait: bool,
    },
    /// Deliver a raw hub event.
    Event {
        /// Hub method name.
        name: String,
        /// Raw payload.
        #[serde(default)]
        payload: Value,
    },
    /// Let time pass.
    Wait {
        /// Milliseconds.
        ms: u64,
    },
    /// Load the next older history page.
    LoadOlder,
    /// Local typing activity.
    Typing {
        /// Typing or stopped.
        is_typing: bool,
    },
    /// Mark everything loaded as read.
    MarkRead,
    /// Toggle a reaction.
    React {
        /// Target message.
        message_id: u64,
        /// Emoji.
        emoji: String,
    },
    /// Recall a message.
    Recall {
        /// Target message.
        message_id: u64,
    },
    /// Delete a message.
    Delete {
        /// Target message.
        message_id: u64,
    },
    /// Drop the hub connection.
    Disconnect {
        /// Reason reported by the channel.
        #[serde(default)]
        reason: String,
    },
    /// Restore the hub connection.
    Reconnect,
    /// Make the next REST fallback send fail.
    FailNextSend {
        /// Error text.
        #[serde(default = "default_failure")]
        error: String,
    },
    /// Make channel sends fail (or succeed again with `null`).
    ChannelSendsFail {
        /// Error text, or `null` to clear.
        error: Option<String>,
    },
    /// Retry every failed send.
    RetryFailed,
    /// Discard every failed send.
    DiscardFailed,
}

fn default_failure() -> String {
    "scripted failure".to_string()
}

/// Outcome of a replay.
#[derive(Debug, Serialize)]
pub struct Report {
    /// Snapshot after the last step.
    pub snapshot: Snapshot,
    /// Steps that returned an error.
    pub errors: Vec<StepFailure>,
    /// Names of the commands the engine invoked on the hub, in order.
    pub invoked: Vec<String>,
    /// Number of sends that went through the REST fallback.
    pub rest_sends: usize,
}

/// A step that failed.
#[derive(Debug, Serialize)]
pub struct StepFailure {
    /// Position in the script.
    pub index: usize,
    /// The step itself.
    pub step: Step,
    /// What went wrong.
    pub error: String,
}

/// Run the replay command.
pub async fn run(script_path: &Path, config: EngineConfig, pretty: bool) -> Result<()> {
    let contents = tokio::fs::read_to_string(script_path)
        .await
        .with_context(|| format!("Failed to read script {}", script_path.display()))?;
    let script: Script = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid replay script {}", script_path.display()))?;

    let report = replay(script, config).await?;

    let output = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{output}");
    Ok(())
}

/// Run a script and collect the report.
pub async fn replay(script: Script, config: EngineConfig) -> Result<Report> {
    let conversation = script.conversation.build()?;
    let local_user = UserId::new(script.local_user);
    let history = parse_history(conversation.id, &script.history)?;
    let last_id = history
        .iter()
        .filter_map(|m| m.id)
        .map(|id| id.value())
        .max()
        .unwrap_or(0);

    let channel = MockChannel::new();
    if script.auto_ack {
        channel.set_auto_ack(local_user, last_id);
    }
    let rest = MockRest::new()
        .with_history(history)
        .with_sender(local_user);

    let handle = ConversationSyncEngine::spawn(
        conversation,
        local_user,
        channel.clone(),
        rest.clone(),
        MemoryKeyValueStore::shared(),
        config,
    );
    wait_ready(&handle).await?;

    let mut errors = Vec::new();
    for (index, step) in script.steps.into_iter().enumerate() {
        tracing::debug!(index, ?step, "replaying step");
        if let Err(e) = apply(&handle, &channel, &rest, &step).await {
            tracing::warn!(index, error = %e, "step failed");
            errors.push(StepFailure {
                index,
                step,
                error: e.to_string(),
            });
        }
        tokio::time::sleep(SETTLE).await;
    }

    let snapshot = handle.snapshot();
    handle.close().await;

    Ok(Report {
        snapshot,
        errors,
        invoked: channel
            .invoked()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        rest_sends: rest.sent().len(),
    })
}

async fn wait_ready(handle: &EngineHandle) -> Result<()> {
    let mut snapshots = handle.subscribe();
    let ready = tokio::time::timeout(READY_TIMEOUT, snapshots.wait_for(|s| s.state.is_ready())).await;
    match ready {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => anyhow::bail!("Engine stopped before becoming ready"),
        Err(_) => anyhow::bail!("Engine did not become ready within {READY_TIMEOUT:?}"),
    }
}

async fn apply(
    handle: &EngineHandle,
    channel: &MockChannel,
    rest: &MockRest,
    step: &Step,
) -> Result<()> {
    match step {
        Step::Send { text, wait } => {
            let temp = handle.send_text(text).await?;
            if *wait {
                handle.delivery(temp).await?;
            }
        }
        Step::Event { name, payload } => channel.push_event(name, payload.clone()),
        Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
        Step::LoadOlder => {
            handle.load_older().await?;
        }
        Step::Typing { is_typing } => handle.set_typing(*is_typing).await?,
        Step::MarkRead => {
            handle.mark_read().await?;
        }
        Step::React { message_id, emoji } => {
            handle.react(MessageId::new(*message_id), emoji).await?;
        }
        Step::Recall { message_id } => handle.recall(MessageId::new(*message_id)).await?,
        Step::Delete { message_id } => handle.delete(MessageId::new(*message_id)).await?,
        Step::Disconnect { reason } => channel.disconnect(reason),
        Step::Reconnect => channel.reconnect(),
        Step::FailNextSend { error } => rest.fail_next_send(error),
        Step::ChannelSendsFail { error } => channel.fail_sends(error.as_deref()),
        Step::RetryFailed => {
            for temp in failed_sends(&handle.snapshot()) {
                handle.retry(temp).await?;
            }
        }
        Step::DiscardFailed => {
            for temp in failed_sends(&handle.snapshot()) {
                handle.discard(temp).await?;
            }
        }
    }
    Ok(())
}

fn failed_sends(snapshot: &Snapshot) -> Vec<ClientTempId> {
    snapshot
        .messages
        .iter()
        .filter(|v| v.delivery == Delivery::Failed)
        .filter_map(|v| v.message.client_temp_id)
        .collect()
}

/// Normalize the scripted history, oldest first.
fn parse_history(conversation: ConversationId, history: &Value) -> Result<Vec<Message>> {
    if history.is_null() {
        return Ok(Vec::new());
    }
    let page = wire::parse_history_page(conversation, history).context("Invalid history")?;
    let mut messages = page.messages;
    messages.sort_by_key(|m| (m.created_at, m.id));
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script(value: Value) -> Script {
        serde_json::from_value(value).unwrap()
    }

    fn fast() -> EngineConfig {
        EngineConfig::default().with_send_timeout(Duration::from_millis(50))
    }

    fn ids(snapshot: &Snapshot) -> Vec<u64> {
        snapshot.message_ids().iter().map(|id| id.value()).collect()
    }

    #[test]
    fn parses_every_step_kind() {
        let script = script(json!({
            "conversation": { "id": 1, "participants": [1, 2] },
            "local_user": 1,
            "steps": [
                { "step": "send", "text": "hi" },
                { "step": "event", "name": "UserOnline", "payload": { "userId": 2 } },
                { "step": "wait", "ms": 5 },
                { "step": "load_older" },
                { "step": "typing", "is_typing": true },
                { "step": "mark_read" },
                { "step": "react", "message_id": 1, "emoji": "👍" },
                { "step": "recall", "message_id": 1 },
                { "step": "delete", "message_id": 1 },
                { "step": "disconnect" },
                { "step": "reconnect" },
                { "step": "fail_next_send" },
                { "step": "channel_sends_fail", "error": null },
                { "step": "retry_failed" },
                { "step": "discard_failed" }
            ]
        }));

        assert_eq!(script.steps.len(), 15);
        assert!(script.auto_ack);
        assert!(matches!(&script.steps[0], Step::Send { wait: false, .. }));
    }

    #[test]
    fn direct_conversation_needs_two_participants() {
        let conversation = ScriptConversation {
            id: 1,
            group: false,
            participants: vec![1],
        };
        assert!(conversation.build().is_err());

        let group = ScriptConversation {
            id: 1,
            group: true,
            participants: vec![1, 2, 3],
        };
        assert!(group.build().unwrap().is_group());
    }

    #[test]
    fn history_is_sorted_oldest_first() {
        let history = json!([
            { "id": 2, "senderId": 2, "content": "b", "createdAt": 20 },
            { "id": 1, "senderId": 2, "content": "a", "createdAt": 10 },
            { "id": 3, "content": "no sender", "createdAt": 30 }
        ]);

        let messages = parse_history(ConversationId::new(1), &history).unwrap();
        let ids: Vec<_> = messages.iter().filter_map(|m| m.id).map(|id| id.value()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn acknowledged_send_is_confirmed() {
        let script = script(json!({
            "conversation": { "id": 1, "participants": [1, 2] },
            "local_user": 1,
            "history": [
                { "id": 1, "senderId": 2, "content": "m1", "createdAt": 10 },
                { "id": 2, "senderId": 2, "content": "m2", "createdAt": 20 }
            ],
            "steps": [{ "step": "send", "text": "hi", "wait": true }]
        }));

        let report = replay(script, fast()).await.unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(ids(&report.snapshot), vec![1, 2, 3]);
        assert_eq!(report.snapshot.pending_count(), 0);
        assert_eq!(report.rest_sends, 0);
        assert!(report.invoked.contains(&"send-message".to_string()));
    }

    #[tokio::test]
    async fn missing_ack_falls_back_to_rest() {
        let script = script(json!({
            "conversation": { "id": 1, "participants": [1, 2] },
            "local_user": 1,
            "auto_ack": false,
            "steps": [{ "step": "send", "text": "hi", "wait": true }]
        }));

        let report = replay(script, fast()).await.unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(report.rest_sends, 1);
        assert_eq!(ids(&report.snapshot), vec![1]);
    }

    #[tokio::test]
    async fn failed_send_can_be_discarded() {
        let script = script(json!({
            "conversation": { "id": 1, "participants": [1, 2] },
            "local_user": 1,
            "auto_ack": false,
            "steps": [
                { "step": "fail_next_send" },
                { "step": "send", "text": "doomed", "wait": true },
                { "step": "discard_failed" }
            ]
        }));

        let report = replay(script, fast()).await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
        assert!(report.snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn step_errors_are_reported() {
        let script = script(json!({
            "conversation": { "id": 1, "participants": [1, 2] },
            "local_user": 1,
            "history": [{ "id": 1, "senderId": 2, "content": "theirs", "createdAt": 10 }],
            "steps": [
                { "step": "recall", "message_id": 1 },
                { "step": "event", "name": "UserTyping", "payload": { "userId": 2 } }
            ]
        }));

        let report = replay(script, fast()).await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 0);
        assert!(report.errors[0].error.contains("not sent by the local user"));
        assert_eq!(report.snapshot.typing, vec![UserId::new(2)]);
    }
}
