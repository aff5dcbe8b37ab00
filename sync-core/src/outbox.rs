//! Optimistic send tracking.
//!
//! Every outgoing message gets a client-generated [`ClientTempId`] and a
//! [`PendingSend`] record here. The record walks a small state machine:
//!
//! ```text
//! Sending ──ack──────────────────────────────▶ (removed, confirmed)
//!    │
//!    ├─timeout / transmit error─▶ RetryingViaFallback ──ok──▶ (removed)
//!    │                                  │
//!    │                                  └─err──▶ Failed ──retry──▶ Sending
//!    └─save failed──────────────────────────────▶ Failed ──discard─▶ (removed)
//! ```
//!
//! Exactly one fallback attempt is made per attempt of a send; the tracker
//! never retries on its own after `Failed`.
//!
//! Late channel acks:
//!
//! - While a fallback is in flight, an ack for the original attempt is
//!   stale and ignored; the fallback result decides the outcome.
//! - Once the send is `Failed`, an ack still confirms it. The server has
//!   stored the message, and a manual retry would post it a second time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use convo_sync_types::{ClientTempId, OutgoingPayload, Timestamp};
use serde::Serialize;
use thiserror::Error;

use crate::timers::{TimerId, TimerKind, Timers};

/// Where a pending send is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Sent (or queued) on the push channel, waiting for the ack.
    Sending,
    /// Ack window elapsed; the payload was handed to the REST fallback.
    RetryingViaFallback,
    /// Fallback failed or the server rejected the message.
    Failed,
}

/// Failure surfaced for a send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The REST fallback also failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The server reported that it could not persist the message.
    #[error("server could not save message: {0}")]
    Rejected(String),

    /// The user discarded the pending message.
    #[error("send discarded")]
    Discarded,
}

/// One in-flight optimistic send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// Correlation id.
    pub client_temp_id: ClientTempId,
    /// What the user asked to send.
    pub payload: OutgoingPayload,
    /// 1 for the first attempt, incremented by [`OptimisticSendTracker::retry`].
    pub attempt: u32,
    /// Current status.
    pub status: SendStatus,
    /// Local creation time.
    pub created_at: Timestamp,
    /// Armed ack timeout, while `Sending`.
    pub timer: Option<TimerId>,
    /// Last failure, while `Failed`.
    pub error: Option<SendError>,
}

/// Payload to resend over REST after the channel gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    /// Correlation id.
    pub client_temp_id: ClientTempId,
    /// Same payload as the channel attempt.
    pub payload: OutgoingPayload,
    /// Attempt this fallback belongs to.
    pub attempt: u32,
}

/// Result of feeding a channel confirmation to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The send was waiting for this ack; its record is gone.
    Confirmed,
    /// The send already moved to the REST fallback; the ack is ignored.
    Stale,
    /// No record for this temp id (already confirmed or discarded).
    Unknown,
}

/// Result of feeding a REST fallback outcome to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// Fallback succeeded; the record is gone.
    Confirmed,
    /// Fallback failed; the send is now `Failed`.
    Failed(SendError),
    /// The send was no longer waiting on a fallback.
    Stale,
}

/// Tracks every optimistic send of one conversation.
#[derive(Debug)]
pub struct OptimisticSendTracker {
    timeout: Duration,
    sends: HashMap<ClientTempId, PendingSend>,
    /// Send order, for stable iteration.
    order: Vec<ClientTempId>,
}

impl OptimisticSendTracker {
    /// Create a tracker whose channel acks time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sends: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a new send and arm its ack timeout.
    ///
    /// Returns immediately with the correlation id.
    pub fn send(
        &mut self,
        payload: OutgoingPayload,
        created_at: Timestamp,
        now: Instant,
        timers: &mut Timers,
    ) -> ClientTempId {
        let client_temp_id = ClientTempId::new();
        let timer = timers.arm(TimerKind::SendTimeout(client_temp_id), now, self.timeout);
        self.sends.insert(
            client_temp_id,
            PendingSend {
                client_temp_id,
                payload,
                attempt: 1,
                status: SendStatus::Sending,
                created_at,
                timer: Some(timer),
                error: None,
            },
        );
        self.order.push(client_temp_id);
        tracing::debug!(client_temp_id = %client_temp_id, "optimistic send registered");
        client_temp_id
    }

    /// The channel confirmed the send.
    pub fn on_ack(&mut self, temp: &ClientTempId, timers: &mut Timers) -> AckOutcome {
        let Some(send) = self.sends.get(temp) else {
            return AckOutcome::Unknown;
        };
        match send.status {
            SendStatus::RetryingViaFallback => {
                tracing::debug!(client_temp_id = %temp, "late channel ack ignored, fallback in flight");
                AckOutcome::Stale
            }
            // Failed included: see the module docs on late acks
            SendStatus::Sending | SendStatus::Failed => {
                self.take(temp, timers);
                AckOutcome::Confirmed
            }
        }
    }

    /// The ack window elapsed. Returns the fallback to run, if any.
    pub fn on_timeout(&mut self, temp: &ClientTempId) -> Option<FallbackRequest> {
        let send = self.sends.get_mut(temp)?;
        if send.status != SendStatus::Sending {
            return None;
        }
        send.timer = None;
        tracing::warn!(client_temp_id = %temp, attempt = send.attempt, "channel ack timed out, falling back to REST");
        Some(Self::begin_fallback(send))
    }

    /// The channel could not transmit the send. Treated like an immediate
    /// timeout.
    pub fn on_failure(
        &mut self,
        temp: &ClientTempId,
        error: &str,
        timers: &mut Timers,
    ) -> Option<FallbackRequest> {
        let send = self.sends.get_mut(temp)?;
        if send.status != SendStatus::Sending {
            return None;
        }
        if let Some(timer) = send.timer.take() {
            timers.cancel(timer);
        }
        tracing::warn!(client_temp_id = %temp, error, "channel send failed, falling back to REST");
        Some(Self::begin_fallback(send))
    }

    /// The REST fallback finished.
    pub fn on_fallback_result(
        &mut self,
        temp: &ClientTempId,
        result: Result<(), String>,
        timers: &mut Timers,
    ) -> FallbackOutcome {
        let Some(send) = self.sends.get_mut(temp) else {
            return FallbackOutcome::Stale;
        };
        if send.status != SendStatus::RetryingViaFallback {
            return FallbackOutcome::Stale;
        }
        match result {
            Ok(()) => {
                self.take(temp, timers);
                FallbackOutcome::Confirmed
            }
            Err(reason) => {
                let error = SendError::SendFailed(reason);
                send.status = SendStatus::Failed;
                send.error = Some(error.clone());
                tracing::error!(client_temp_id = %temp, %error, "fallback send failed");
                FallbackOutcome::Failed(error)
            }
        }
    }

    /// The server reported it could not save the message.
    pub fn on_save_failed(
        &mut self,
        temp: &ClientTempId,
        reason: &str,
        timers: &mut Timers,
    ) -> Option<SendError> {
        let send = self.sends.get_mut(temp)?;
        if send.status == SendStatus::Failed {
            return None;
        }
        if let Some(timer) = send.timer.take() {
            timers.cancel(timer);
        }
        let error = SendError::Rejected(reason.to_string());
        send.status = SendStatus::Failed;
        send.error = Some(error.clone());
        tracing::error!(client_temp_id = %temp, %error, "server rejected message");
        Some(error)
    }

    /// Start another attempt of a failed send, keeping its temp id.
    ///
    /// Returns the payload to transmit, or `None` if the send is not failed.
    pub fn retry(
        &mut self,
        temp: &ClientTempId,
        now: Instant,
        timers: &mut Timers,
    ) -> Option<OutgoingPayload> {
        let send = self.sends.get_mut(temp)?;
        if send.status != SendStatus::Failed {
            return None;
        }
        send.attempt += 1;
        send.status = SendStatus::Sending;
        send.error = None;
        send.timer = Some(timers.arm(TimerKind::SendTimeout(*temp), now, self.timeout));
        tracing::info!(client_temp_id = %temp, attempt = send.attempt, "retrying send");
        Some(send.payload.clone())
    }

    /// Drop a send regardless of status.
    pub fn discard(&mut self, temp: &ClientTempId, timers: &mut Timers) -> Option<PendingSend> {
        self.take(temp, timers)
    }

    /// Status of a send, if it is still tracked.
    pub fn status(&self, temp: &ClientTempId) -> Option<SendStatus> {
        self.sends.get(temp).map(|s| s.status)
    }

    /// Look up a send.
    pub fn get(&self, temp: &ClientTempId) -> Option<&PendingSend> {
        self.sends.get(temp)
    }

    /// Iterate tracked sends in send order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingSend> {
        self.order.iter().filter_map(|t| self.sends.get(t))
    }

    /// Number of tracked sends.
    pub fn len(&self) -> usize {
        self.sends.len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }

    /// Drop every send and cancel their timers.
    pub fn clear(&mut self, timers: &mut Timers) {
        for send in self.sends.values() {
            if let Some(timer) = send.timer {
                timers.cancel(timer);
            }
        }
        self.sends.clear();
        self.order.clear();
    }

    fn begin_fallback(send: &mut PendingSend) -> FallbackRequest {
        send.status = SendStatus::RetryingViaFallback;
        FallbackRequest {
            client_temp_id: send.client_temp_id,
            payload: send.payload.clone(),
            attempt: send.attempt,
        }
    }

    fn take(&mut self, temp: &ClientTempId, timers: &mut Timers) -> Option<PendingSend> {
        let send = self.sends.remove(temp)?;
        if let Some(timer) = send.timer {
            timers.cancel(timer);
        }
        self.order.retain(|t| t != temp);
        Some(send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn setup() -> (OptimisticSendTracker, Timers, Instant) {
        (OptimisticSendTracker::new(TIMEOUT), Timers::new(), Instant::now())
    }

    fn fire(timers: &mut Timers, at: Instant) -> Vec<ClientTempId> {
        timers
            .pop_expired(at)
            .into_iter()
            .filter_map(|(_, kind)| match kind {
                TimerKind::SendTimeout(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn ack_confirms_and_cancels_timeout() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);

        assert_eq!(tracker.status(&temp), Some(SendStatus::Sending));
        assert_eq!(tracker.on_ack(&temp, &mut timers), AckOutcome::Confirmed);
        assert!(tracker.is_empty());
        assert!(timers.is_empty());
        assert_eq!(tracker.on_ack(&temp, &mut timers), AckOutcome::Unknown);
    }

    #[test]
    fn timeout_triggers_exactly_one_fallback() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);

        let fired = fire(&mut timers, now + TIMEOUT);
        assert_eq!(fired, vec![temp]);

        let fallback = tracker.on_timeout(&temp).unwrap();
        assert_eq!(fallback.payload.content, "hi");
        assert_eq!(fallback.attempt, 1);
        assert_eq!(tracker.status(&temp), Some(SendStatus::RetryingViaFallback));

        // A duplicate timeout (or transmit error) does not start another one
        assert!(tracker.on_timeout(&temp).is_none());
        assert!(tracker.on_failure(&temp, "closed", &mut timers).is_none());
    }

    #[test]
    fn late_ack_during_fallback_is_stale() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);
        fire(&mut timers, now + TIMEOUT);
        tracker.on_timeout(&temp);

        assert_eq!(tracker.on_ack(&temp, &mut timers), AckOutcome::Stale);
        assert_eq!(
            tracker.on_fallback_result(&temp, Ok(()), &mut timers),
            FallbackOutcome::Confirmed
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn transmit_error_falls_back_immediately() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);

        assert!(tracker.on_failure(&temp, "channel closed", &mut timers).is_some());
        // Ack timer was cancelled along the way
        assert!(timers.is_empty());
    }

    #[test]
    fn fallback_failure_marks_failed_then_retry() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);
        fire(&mut timers, now + TIMEOUT);
        tracker.on_timeout(&temp);

        let outcome = tracker.on_fallback_result(&temp, Err("503".into()), &mut timers);
        assert_eq!(outcome, FallbackOutcome::Failed(SendError::SendFailed("503".into())));
        assert_eq!(tracker.status(&temp), Some(SendStatus::Failed));

        // Stale fallback results after failure change nothing
        assert_eq!(
            tracker.on_fallback_result(&temp, Ok(()), &mut timers),
            FallbackOutcome::Stale
        );

        let payload = tracker.retry(&temp, now + TIMEOUT, &mut timers).unwrap();
        assert_eq!(payload.content, "hi");
        let send = tracker.get(&temp).unwrap();
        assert_eq!(send.attempt, 2);
        assert_eq!(send.status, SendStatus::Sending);
        assert!(send.error.is_none());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn retry_only_from_failed() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);
        assert!(tracker.retry(&temp, now, &mut timers).is_none());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn save_failed_marks_failed() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);

        let error = tracker.on_save_failed(&temp, "too long", &mut timers).unwrap();
        assert_eq!(error, SendError::Rejected("too long".into()));
        assert!(timers.is_empty());
        assert!(tracker.on_save_failed(&temp, "again", &mut timers).is_none());
    }

    #[test]
    fn late_ack_after_failure_confirms() {
        let (mut tracker, mut timers, now) = setup();
        let temp = tracker.send(OutgoingPayload::text("hi"), Timestamp::from_millis(1), now, &mut timers);
        tracker.on_save_failed(&temp, "db", &mut timers);

        assert_eq!(tracker.on_ack(&temp, &mut timers), AckOutcome::Confirmed);
        assert!(tracker.is_empty());
    }

    #[test]
    fn concurrent_sends_are_independent() {
        let (mut tracker, mut timers, now) = setup();
        let a = tracker.send(OutgoingPayload::text("a"), Timestamp::from_millis(1), now, &mut timers);
        let b = tracker.send(
            OutgoingPayload::text("b"),
            Timestamp::from_millis(2),
            now + Duration::from_secs(5),
            &mut timers,
        );

        tracker.on_ack(&b, &mut timers);
        let fired = fire(&mut timers, now + TIMEOUT);
        assert_eq!(fired, vec![a]);
        assert!(tracker.on_timeout(&a).is_some());

        let order: Vec<ClientTempId> = tracker.iter().map(|s| s.client_temp_id).collect();
        assert_eq!(order, vec![a]);
    }

    #[test]
    fn discard_and_clear_cancel_timers() {
        let (mut tracker, mut timers, now) = setup();
        let a = tracker.send(OutgoingPayload::text("a"), Timestamp::from_millis(1), now, &mut timers);
        tracker.send(OutgoingPayload::text("b"), Timestamp::from_millis(2), now, &mut timers);

        assert!(tracker.discard(&a, &mut timers).is_some());
        assert_eq!(timers.len(), 1);

        tracker.clear(&mut timers);
        assert!(tracker.is_empty());
        assert!(timers.is_empty());
    }
}
