//! Outbound message queue and dead-letter documents.

use crate::{modify, DocumentStore};
use fleet_core::{
    AgentId, FleetResult, Message, MessageId, MessageStatus, QueueError, Timestamp,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Deliveries remembered after their messages leave the queue.
pub const DELIVERY_HISTORY_LIMIT: usize = 1024;

/// Every message not yet retired or buried, in enqueue order, plus a short
/// history of recent deliveries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueDocument {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Oldest first, at most `DELIVERY_HISTORY_LIMIT` entries.
    #[serde(default)]
    pub delivered: Vec<DeliveryRecord>,
}

impl QueueDocument {
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn delivery(&self, id: MessageId) -> Option<&DeliveryRecord> {
        self.delivered.iter().rev().find(|r| r.message_id == id)
    }

    /// Drop `Delivered` messages that no pending message depends on,
    /// keeping a record of each in the delivery history.
    fn retire_delivered(&mut self) -> usize {
        let needed: HashSet<MessageId> = self
            .messages
            .iter()
            .filter(|m| !m.is_terminal())
            .flat_map(|m| m.dependencies.iter().copied())
            .collect();
        let (retired, kept): (Vec<Message>, Vec<Message>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| m.status == MessageStatus::Delivered && !needed.contains(&m.id));
        self.messages = kept;

        self.delivered
            .extend(retired.iter().filter_map(DeliveryRecord::from_message));
        let excess = self.delivered.len().saturating_sub(DELIVERY_HISTORY_LIMIT);
        self.delivered.drain(..excess);
        retired.len()
    }

    fn has_retirable(&self) -> bool {
        self.messages.iter().any(|m| m.status == MessageStatus::Delivered)
    }
}

/// What is kept of a delivered message once it leaves the queue. The
/// recipient's inbox holds the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub recipient: AgentId,
    pub attempt_count: u32,
    pub delivered_at: Timestamp,
}

impl DeliveryRecord {
    fn from_message(message: &Message) -> Option<Self> {
        Some(Self {
            message_id: message.id,
            recipient: message.recipient.clone(),
            attempt_count: message.attempt_count,
            delivered_at: message.delivered_at?,
        })
    }
}

/// A message that exhausted its attempts, kept for an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
    pub buried_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeadLetterDocument {
    #[serde(default)]
    pub entries: Vec<DeadLetter>,
}

/// Durable outbound queue. Shared by senders (enqueue) and the processor.
#[derive(Clone)]
pub struct OutboundQueue {
    queue: Arc<dyn DocumentStore<QueueDocument>>,
    dead_letters: Arc<dyn DocumentStore<DeadLetterDocument>>,
    max_retries: u32,
}

impl OutboundQueue {
    pub fn new(
        queue: Arc<dyn DocumentStore<QueueDocument>>,
        dead_letters: Arc<dyn DocumentStore<DeadLetterDocument>>,
    ) -> Self {
        Self {
            queue,
            dead_letters,
            max_retries: 5,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Append a message. Invariants are checked before anything is written.
    ///
    /// Dependencies must name messages the queue already knows about (still
    /// queued, recently delivered or dead-lettered). A message can therefore
    /// only wait on messages ahead of it, so dependency chains never cycle.
    pub fn enqueue(&self, message: Message) -> FleetResult<MessageId> {
        message.check_invariants()?;
        let id = message.id;
        let buried: HashSet<MessageId> = if message.dependencies.is_empty() {
            HashSet::new()
        } else {
            self.dead_letters()?.iter().map(|d| d.message.id).collect()
        };
        modify(self.queue.as_ref(), self.max_retries, |doc| {
            if doc.get(id).is_some() || doc.delivery(id).is_some() {
                return Err(QueueError::DuplicateMessage { message_id: id }.into());
            }
            let unknown = message.dependencies.iter().find(|dep| {
                doc.get(**dep).is_none() && doc.delivery(**dep).is_none() && !buried.contains(*dep)
            });
            if let Some(dep) = unknown {
                return Err(ValidationError::InvalidValue {
                    field: "dependencies".to_string(),
                    reason: format!("{dep} is not an earlier message in the queue"),
                }
                .into());
            }
            doc.messages.push(message.clone());
            Ok(())
        })?;
        tracing::info!(message_id = %id, recipient = %message.recipient, "message queued");
        Ok(id)
    }

    pub fn snapshot(&self) -> FleetResult<QueueDocument> {
        Ok(self.queue.load()?.value)
    }

    pub fn get(&self, id: MessageId) -> FleetResult<Option<Message>> {
        Ok(self.snapshot()?.get(id).cloned())
    }

    /// Delivery record of a message, whether it is still queued as
    /// `Delivered` or already retired into the history.
    pub fn delivery(&self, id: MessageId) -> FleetResult<Option<DeliveryRecord>> {
        let doc = self.snapshot()?;
        Ok(doc
            .get(id)
            .and_then(DeliveryRecord::from_message)
            .or_else(|| doc.delivery(id).cloned()))
    }

    /// Move delivered messages out of the queue once nothing pending waits
    /// on them. Returns how many left.
    pub fn retire_delivered(&self) -> FleetResult<usize> {
        if !self.snapshot()?.has_retirable() {
            return Ok(0);
        }
        let retired = modify(self.queue.as_ref(), self.max_retries, |doc| {
            Ok(doc.retire_delivered())
        })?;
        if retired > 0 {
            tracing::debug!(retired, "delivered messages retired from queue");
        }
        Ok(retired)
    }

    /// Apply `f` to one message and persist the result.
    pub fn update<R>(
        &self,
        id: MessageId,
        mut f: impl FnMut(&mut Message) -> FleetResult<R>,
    ) -> FleetResult<R> {
        modify(self.queue.as_ref(), self.max_retries, |doc| {
            let message = doc
                .get_mut(id)
                .ok_or(QueueError::UnknownMessage { message_id: id })?;
            let out = f(message)?;
            message.check_invariants()?;
            Ok(out)
        })
    }

    /// Move a `Dead` message out of the queue into the dead-letter list.
    /// The dead-letter entry is written first so a crash in between leaves a
    /// duplicate rather than a loss.
    pub fn move_to_dead_letters(&self, id: MessageId, at: Timestamp) -> FleetResult<()> {
        let message = self
            .get(id)?
            .ok_or(QueueError::UnknownMessage { message_id: id })?;
        let reason = message
            .last_error
            .clone()
            .unwrap_or_else(|| "attempts exhausted".to_string());

        modify(self.dead_letters.as_ref(), self.max_retries, |doc| {
            if !doc.entries.iter().any(|e| e.message.id == id) {
                doc.entries.push(DeadLetter {
                    message: message.clone(),
                    reason: reason.clone(),
                    buried_at: at,
                });
            }
            Ok(())
        })?;
        modify(self.queue.as_ref(), self.max_retries, |doc| {
            doc.messages.retain(|m| m.id != id);
            Ok(())
        })?;
        tracing::warn!(message_id = %id, recipient = %message.recipient, reason = %reason, "message dead-lettered");
        Ok(())
    }

    pub fn dead_letters(&self) -> FleetResult<Vec<DeadLetter>> {
        Ok(self.dead_letters.load()?.value.entries)
    }
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
