//! Outbound queue consumption.
//!
//! Each pass sweeps exhausted messages into the dead-letter list, picks the
//! head message of every recipient, and attempts the ones that are due.
//! An adapter success is only a claim; the message is marked `Delivered`
//! once a matching envelope shows up in the recipient's inbox.

use crate::delivery::{frame_payload, DeliveryAdapter};
use crate::registry::AgentRegistry;
use chrono::Utc;
use fleet_core::{
    fingerprint, AgentId, BackoffPolicy, DeliveryConfig, DeliveryError, FleetResult, Message,
    MessageId, MessageStatus, Timestamp,
};
use fleet_storage::{InboxStore, OutboundQueue, QueueDocument};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// SUMMARY
// ============================================================================

/// What one processing pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    /// Attempts started
    pub attempted: usize,
    pub delivered: usize,
    /// Attempts that failed and were requeued with a backoff
    pub retried: usize,
    /// Messages moved to the dead-letter list
    pub dead_lettered: usize,
    /// Head messages still in backoff
    pub waiting: usize,
    /// Head messages whose dependencies are not terminal yet
    pub blocked: usize,
    /// Non-terminal messages left after the pass
    pub pending: usize,
    /// Earliest retry time among waiting heads
    pub next_due: Option<Timestamp>,
}

impl ProcessSummary {
    fn absorb(&mut self, other: &ProcessSummary) {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.waiting = other.waiting;
        self.blocked = other.blocked;
        self.pending = other.pending;
        self.next_due = other.next_due;
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Delivered,
    Requeued { retry_at: Timestamp, reason: String },
    DeadLettered { reason: String },
}

// ============================================================================
// PROCESSOR
// ============================================================================

pub struct MessageQueueProcessor {
    queue: OutboundQueue,
    registry: Arc<AgentRegistry>,
    adapter: DeliveryAdapter,
    inbox: Arc<dyn InboxStore>,
    backoff: BackoffPolicy,
    verification_timeout: Duration,
    poll_interval: Duration,
}

impl MessageQueueProcessor {
    pub fn new(
        queue: OutboundQueue,
        registry: Arc<AgentRegistry>,
        adapter: DeliveryAdapter,
        inbox: Arc<dyn InboxStore>,
    ) -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            queue,
            registry,
            adapter,
            inbox,
            backoff: BackoffPolicy::default(),
            verification_timeout: delivery.verification_timeout,
            poll_interval: delivery.verification_poll_interval,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_verification(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.verification_timeout = timeout;
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Requeue messages left in `Delivering` by a process that died
    /// mid-attempt. Whether the text arrived is unknown, so the attempt
    /// counts as failed. Call once before the first pass.
    pub fn recover_interrupted(&self, now: Timestamp) -> FleetResult<usize> {
        let doc = self.queue.snapshot()?;
        let mut recovered = 0;
        for message in doc.messages.iter().filter(|m| m.status == MessageStatus::Delivering) {
            let status = self.queue.update(message.id, |m| {
                m.record_failure("interrupted during delivery", now)
            })?;
            tracing::warn!(message_id = %message.id, recipient = %message.recipient, status = %status, "recovered interrupted delivery");
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn process_once(&self) -> FleetResult<ProcessSummary> {
        self.process_at(Utc::now()).await
    }

    /// One pass with `now` as the reference time for backoff checks.
    pub async fn process_at(&self, now: Timestamp) -> FleetResult<ProcessSummary> {
        let mut summary = ProcessSummary {
            dead_lettered: self.sweep_exhausted(now)?,
            ..Default::default()
        };

        let doc = self.queue.snapshot()?;
        let mut due = Vec::new();
        let mut blocked = Vec::new();
        for head in recipient_heads(&doc) {
            if !dependencies_settled(&doc, head) {
                blocked.push(head.id);
            } else if head.is_due(now) {
                due.push(head.id);
            } else {
                summary.waiting += 1;
                summary.next_due = earliest(summary.next_due, head.next_attempt_at);
            }
        }

        summary.blocked = blocked.len();
        // Nothing due and nothing in backoff: no head can move again, so the
        // blocked ones never will either.
        if due.is_empty() && summary.waiting == 0 {
            for id in blocked {
                self.abandon(id, now)?;
                summary.dead_lettered += 1;
            }
        }

        for id in due {
            summary.attempted += 1;
            match self.attempt(id, now).await? {
                AttemptOutcome::Delivered => summary.delivered += 1,
                AttemptOutcome::Requeued { retry_at, .. } => {
                    summary.retried += 1;
                    summary.next_due = earliest(summary.next_due, Some(retry_at));
                }
                AttemptOutcome::DeadLettered { .. } => summary.dead_lettered += 1,
            }
        }

        self.queue.retire_delivered()?;
        summary.pending = self
            .queue
            .snapshot()?
            .messages
            .iter()
            .filter(|m| !m.is_terminal())
            .count();
        tracing::debug!(
            attempted = summary.attempted,
            delivered = summary.delivered,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            pending = summary.pending,
            "queue pass finished"
        );
        Ok(summary)
    }

    /// Keep processing until every message is terminal. Sleeps through
    /// backoff windows; stops early only if the remaining heads belong to
    /// another process's in-flight attempts.
    pub async fn run_until_idle(&self) -> FleetResult<ProcessSummary> {
        self.recover_interrupted(Utc::now())?;
        let mut total = ProcessSummary::default();
        loop {
            let pass = self.process_once().await?;
            total.absorb(&pass);
            if pass.pending == 0 {
                break;
            }
            if pass.attempted == 0 && pass.dead_lettered == 0 {
                match pass.next_due {
                    Some(at) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tracing::debug!(wait_ms = wait.as_millis() as u64, "waiting for backoff");
                        tokio::time::sleep(wait.max(self.poll_interval)).await;
                    }
                    None => {
                        tracing::warn!(
                            pending = pass.pending,
                            "queue stalled: remaining messages are mid-delivery elsewhere"
                        );
                        break;
                    }
                }
            }
        }
        Ok(total)
    }

    /// Run one attempt for a `Queued` message and persist the outcome.
    pub async fn attempt(&self, id: MessageId, now: Timestamp) -> FleetResult<AttemptOutcome> {
        let message = self.queue.update(id, |m| {
            m.begin_attempt()?;
            Ok(m.clone())
        })?;
        tracing::debug!(message_id = %id, recipient = %message.recipient, attempt = message.attempt_count, "delivery attempt started");

        match self.deliver_and_verify(&message).await {
            Ok(()) => {
                self.queue.update(id, |m| m.mark_delivered(Utc::now()))?;
                tracing::info!(
                    message_id = %id,
                    recipient = %message.recipient,
                    attempts = message.attempt_count,
                    "message delivered"
                );
                Ok(AttemptOutcome::Delivered)
            }
            Err(e) => {
                let reason = e.to_string();
                let retry_at = now + to_chrono(self.backoff.delay_for(message.attempt_count));
                let status = self.queue.update(id, |m| m.record_failure(&reason, retry_at))?;
                tracing::warn!(
                    message_id = %id,
                    recipient = %message.recipient,
                    attempt = message.attempt_count,
                    max_attempts = message.max_attempts,
                    error = %reason,
                    "delivery attempt failed"
                );
                if status == MessageStatus::Failed {
                    self.bury(id, now)?;
                    Ok(AttemptOutcome::DeadLettered { reason })
                } else {
                    Ok(AttemptOutcome::Requeued { retry_at, reason })
                }
            }
        }
    }

    async fn deliver_and_verify(&self, message: &Message) -> FleetResult<()> {
        let endpoint = self.registry.resolve(&message.recipient)?;
        self.adapter.deliver(endpoint, &frame_payload(message)).await?;
        self.verify(message).await
    }

    /// Poll the recipient's inbox for an envelope carrying this message id
    /// and the fingerprint of its content.
    async fn verify(&self, message: &Message) -> FleetResult<()> {
        let expected = fingerprint(message.content.as_bytes());
        let started = Instant::now();
        loop {
            if let Some(envelope) = self.inbox.find(&message.recipient, message.id)? {
                if envelope.matches(message.id, &expected) {
                    return Ok(());
                }
                tracing::warn!(message_id = %message.id, "inbox envelope content does not match");
            }
            let waited = started.elapsed();
            if waited >= self.verification_timeout {
                return Err(DeliveryError::VerificationFailed {
                    message_id: message.id,
                    waited_ms: waited.as_millis() as u64,
                }
                .into());
            }
            tracing::debug!(message_id = %message.id, waited_ms = waited.as_millis() as u64, "awaiting inbox envelope");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Dead-letter a queued message without attempting it.
    fn abandon(&self, id: MessageId, now: Timestamp) -> FleetResult<()> {
        let reason = "dependencies can never complete";
        let recipient = self.queue.update(id, |m| {
            m.abandon(reason)?;
            Ok(m.recipient.clone())
        })?;
        tracing::warn!(message_id = %id, recipient = %recipient, reason, "abandoning blocked message");
        self.bury(id, now)
    }

    /// `Failed → Dead`, then out of the queue.
    fn bury(&self, id: MessageId, now: Timestamp) -> FleetResult<()> {
        self.queue.update(id, |m| m.bury())?;
        self.queue.move_to_dead_letters(id, now)
    }

    /// Finish anything a previous pass left half-buried.
    fn sweep_exhausted(&self, now: Timestamp) -> FleetResult<usize> {
        let doc = self.queue.snapshot()?;
        let mut swept = 0;
        for message in &doc.messages {
            match message.status {
                MessageStatus::Failed => self.bury(message.id, now)?,
                MessageStatus::Dead => self.queue.move_to_dead_letters(message.id, now)?,
                _ => continue,
            }
            swept += 1;
        }
        Ok(swept)
    }
}

impl std::fmt::Debug for MessageQueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueueProcessor")
            .field("adapter", &self.adapter)
            .field("backoff", &self.backoff)
            .field("verification_timeout", &self.verification_timeout)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SELECTION
// ============================================================================

/// First non-terminal message of each recipient, in queue order.
fn recipient_heads(doc: &QueueDocument) -> Vec<&Message> {
    let mut seen: HashSet<&AgentId> = HashSet::new();
    doc.messages
        .iter()
        .filter(|m| !m.is_terminal())
        .filter(|m| seen.insert(&m.recipient))
        .collect()
}

/// Dependencies absent from the queue were dead-lettered or never existed;
/// neither can ever change state again.
fn dependencies_settled(doc: &QueueDocument, message: &Message) -> bool {
    message
        .dependencies
        .iter()
        .all(|dep| doc.get(*dep).map_or(true, Message::is_terminal))
}

fn earliest(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{shared_device, InputDevice};
    use crate::devices::InboxDropDevice;
    use async_trait::async_trait;
    use fleet_core::{AgentEndpoint, Locator, ScreenBounds};
    use fleet_storage::{InMemoryDocumentStore, InMemoryInbox};

    /// Drops into the inbox, after failing the first `failures` injections.
    struct Flaky {
        inner: InboxDropDevice,
        failures: u32,
    }

    #[async_trait]
    impl InputDevice for Flaky {
        async fn focus(&mut self, target: Locator) -> FleetResult<()> {
            self.inner.focus(target).await
        }

        async fn clear(&mut self) -> FleetResult<()> {
            self.inner.clear().await
        }

        async fn inject(&mut self, text: &str) -> FleetResult<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(DeliveryError::Failed {
                    reason: "window not responding".to_string(),
                }
                .into());
            }
            self.inner.inject(text).await
        }
    }

    fn processor(failures: u32) -> MessageQueueProcessor {
        let registry = Arc::new(AgentRegistry::from_endpoints(
            vec![
                AgentEndpoint::new("Agent-1", Locator::new(100, 100), "inboxes/Agent-1"),
                AgentEndpoint::new("Agent-2", Locator::new(900, 100), "inboxes/Agent-2"),
            ],
            ScreenBounds::default(),
        ));
        let inbox: Arc<dyn InboxStore> = Arc::new(InMemoryInbox::new());
        let device = Flaky {
            inner: InboxDropDevice::new(registry.clone(), inbox.clone()),
            failures,
        };
        let queue = OutboundQueue::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(InMemoryDocumentStore::new()),
        );
        MessageQueueProcessor::new(
            queue,
            registry,
            DeliveryAdapter::new(shared_device(device), Duration::from_secs(1)),
            inbox,
        )
        .with_backoff(BackoffPolicy::schedule(
            vec![Duration::from_secs(5), Duration::from_secs(15), Duration::from_secs(45)],
            Duration::from_secs(300),
        ))
        .with_verification(Duration::from_millis(50), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_delivers_and_verifies() {
        let p = processor(0);
        let id = p.queue().enqueue(Message::new("Captain", "Agent-1", "hello")).unwrap();
        let summary = p.process_once().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.pending, 0);
        // Delivered messages leave the queue; the record stays in history
        assert!(p.queue().get(id).unwrap().is_none());
        let record = p.queue().delivery(id).unwrap().unwrap();
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.recipient, "Agent-1");
    }

    #[tokio::test]
    async fn test_failure_waits_out_backoff() {
        let p = processor(1);
        let now = Utc::now();
        let id = p.queue().enqueue(Message::new("Captain", "Agent-1", "hello")).unwrap();

        let first = p.process_at(now).await.unwrap();
        assert_eq!(first.retried, 1);
        let msg = p.queue().get(id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.next_attempt_at, Some(now + chrono::Duration::seconds(5)));

        let early = p.process_at(now + chrono::Duration::seconds(4)).await.unwrap();
        assert_eq!(early.attempted, 0);
        assert_eq!(early.waiting, 1);

        let later = p.process_at(now + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(later.delivered, 1);
    }

    #[tokio::test]
    async fn test_fifo_per_recipient() {
        let p = processor(1);
        let now = Utc::now();
        let first = p.queue().enqueue(Message::new("Captain", "Agent-1", "one")).unwrap();
        let second = p.queue().enqueue(Message::new("Captain", "Agent-1", "two")).unwrap();
        let other = p.queue().enqueue(Message::new("Captain", "Agent-2", "three")).unwrap();

        p.process_at(now).await.unwrap();
        // First failed and waits; second is held behind it; other recipient proceeds
        assert_eq!(p.queue().get(first).unwrap().unwrap().status, MessageStatus::Queued);
        assert_eq!(p.queue().get(second).unwrap().unwrap().attempt_count, 0);
        assert!(p.queue().delivery(other).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_recipient_exhausts_into_dead_letters() {
        let p = processor(0);
        let now = Utc::now();
        let id = p
            .queue()
            .enqueue(Message::new("Captain", "Agent-9", "anyone?").with_max_attempts(2))
            .unwrap();
        p.process_at(now).await.unwrap();
        let summary = p.process_at(now + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        assert!(p.queue().get(id).unwrap().is_none());
        let dead = p.queue().dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.status, MessageStatus::Dead);
        assert!(dead[0].reason.contains("Agent-9"));
    }

    #[tokio::test]
    async fn test_dependencies_hold_message_back() {
        let p = processor(0);
        let first = Message::new("Captain", "Agent-1", "setup");
        let first_id = first.id;
        let dependent = Message::new("Captain", "Agent-2", "go").with_dependencies(vec![first_id]);
        let dependent_id = dependent.id;
        p.queue().enqueue(first).unwrap();
        p.queue().enqueue(dependent).unwrap();

        let pass = p.process_once().await.unwrap();
        assert_eq!(pass.blocked, 1);
        assert_eq!(pass.delivered, 1);
        assert_eq!(p.queue().get(dependent_id).unwrap().unwrap().attempt_count, 0);
        // Still needed by the dependent, so not retired yet
        assert!(p.queue().get(first_id).unwrap().is_some());

        let pass = p.process_once().await.unwrap();
        assert_eq!(pass.delivered, 1);
        assert_eq!(pass.pending, 0);
        assert!(p.queue().snapshot().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_head_waiting_on_later_message_is_dead_lettered() {
        let p = processor(0);
        let first = p.queue().enqueue(Message::new("Captain", "Agent-1", "first")).unwrap();
        let later = p.queue().enqueue(Message::new("Captain", "Agent-1", "later")).unwrap();
        // Only a hand edit can point a message at one behind it
        p.queue()
            .update(first, |m| {
                m.dependencies = vec![later];
                Ok(())
            })
            .unwrap();

        let total = p.run_until_idle().await.unwrap();
        assert_eq!(total.pending, 0);
        assert_eq!(total.dead_lettered, 1);
        assert_eq!(total.delivered, 1);

        let dead = p.queue().dead_letters().unwrap();
        assert_eq!(dead[0].message.id, first);
        assert!(dead[0].reason.contains("dependencies"));
        assert!(p.queue().delivery(later).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dependency_cycle_is_dead_lettered() {
        let p = processor(0);
        let a = p.queue().enqueue(Message::new("Captain", "Agent-1", "a")).unwrap();
        let b = p
            .queue()
            .enqueue(Message::new("Captain", "Agent-2", "b").with_dependencies(vec![a]))
            .unwrap();
        p.queue()
            .update(a, |m| {
                m.dependencies = vec![b];
                Ok(())
            })
            .unwrap();

        let total = p.run_until_idle().await.unwrap();
        assert_eq!(total.pending, 0);
        assert_eq!(total.dead_lettered, 2);
        assert!(p.queue().snapshot().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_recover_interrupted_delivery() {
        let p = processor(0);
        let id = p.queue().enqueue(Message::new("Captain", "Agent-1", "hi")).unwrap();
        p.queue().update(id, |m| m.begin_attempt()).unwrap();

        assert_eq!(p.recover_interrupted(Utc::now()).unwrap(), 1);
        let msg = p.queue().get(id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.last_error.as_deref(), Some("interrupted during delivery"));

        let total = p.run_until_idle().await.unwrap();
        assert_eq!(total.delivered, 1);
    }

    #[test]
    fn test_earliest() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(1);
        assert_eq!(earliest(None, None), None);
        assert_eq!(earliest(Some(later), None), Some(later));
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
    }
}
