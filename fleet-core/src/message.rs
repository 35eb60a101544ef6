//! Outbound message entity and its delivery state machine.
//!
//! All transitions are methods on [`Message`] so the queue processor never
//! pokes at `status` directly. Each method checks the current state and
//! returns a `QueueError::IllegalTransition` if it doesn't match.

use crate::{
    new_message_id, AgentId, FleetResult, MessageId, MessagePriority, MessageStatus, QueueError,
    Timestamp, ValidationError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Default retry budget when the sender does not set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A message from one agent to another, with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message
    pub id: MessageId,
    /// Agent (or operator) that sent the message
    pub sender: AgentId,
    /// Recipient agent
    pub recipient: AgentId,
    /// Text injected into the recipient's session
    pub content: String,
    /// Free-form routing label (e.g. "direct", "broadcast", "system")
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub status: MessageStatus,
    /// Number of delivery attempts started so far
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub created_at: Timestamp,
    #[serde(default)]
    pub delivered_at: Option<Timestamp>,
    /// Earliest time the next attempt may start (set after a failure)
    #[serde(default)]
    pub next_attempt_at: Option<Timestamp>,
    /// Most recent failure reason
    #[serde(default)]
    pub last_error: Option<String>,
    /// Messages that must reach a terminal state before this one is sent
    #[serde(default)]
    pub dependencies: Vec<MessageId>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_category() -> String {
    "direct".to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Message {
    /// Create a new queued message.
    pub fn new(sender: &str, recipient: &str, content: &str) -> Self {
        Self {
            id: new_message_id(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            category: default_category(),
            priority: MessagePriority::Normal,
            status: MessageStatus::Queued,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: Utc::now(),
            delivered_at: None,
            next_attempt_at: None,
            last_error: None,
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<MessageId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the message may start an attempt at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == MessageStatus::Queued && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// `Queued → Delivering`. Counts the attempt.
    pub fn begin_attempt(&mut self) -> FleetResult<()> {
        self.expect_status(MessageStatus::Queued, MessageStatus::Delivering)?;
        if self.attempt_count >= self.max_attempts {
            return Err(QueueError::IllegalTransition {
                message_id: self.id,
                from: self.status,
                to: MessageStatus::Delivering,
            }
            .into());
        }
        self.attempt_count += 1;
        self.status = MessageStatus::Delivering;
        self.next_attempt_at = None;
        Ok(())
    }

    /// `Delivering → Delivered`.
    pub fn mark_delivered(&mut self, at: Timestamp) -> FleetResult<()> {
        self.expect_status(MessageStatus::Delivering, MessageStatus::Delivered)?;
        self.status = MessageStatus::Delivered;
        self.delivered_at = Some(at);
        self.last_error = None;
        Ok(())
    }

    /// `Delivering → Queued` (retry at `retry_at`) or `Delivering → Failed`
    /// once the attempt budget is spent. Returns the new status.
    pub fn record_failure(
        &mut self,
        reason: &str,
        retry_at: Timestamp,
    ) -> FleetResult<MessageStatus> {
        self.expect_status(MessageStatus::Delivering, MessageStatus::Queued)?;
        self.last_error = Some(reason.to_string());
        if self.attempt_count >= self.max_attempts {
            self.status = MessageStatus::Failed;
            self.next_attempt_at = None;
        } else {
            self.status = MessageStatus::Queued;
            self.next_attempt_at = Some(retry_at);
        }
        Ok(self.status)
    }

    /// `Queued → Failed` without an attempt, for a message that can never
    /// become due.
    pub fn abandon(&mut self, reason: &str) -> FleetResult<()> {
        self.expect_status(MessageStatus::Queued, MessageStatus::Failed)?;
        self.status = MessageStatus::Failed;
        self.next_attempt_at = None;
        self.last_error = Some(reason.to_string());
        Ok(())
    }

    /// `Failed → Dead`.
    pub fn bury(&mut self) -> FleetResult<()> {
        self.expect_status(MessageStatus::Failed, MessageStatus::Dead)?;
        self.status = MessageStatus::Dead;
        Ok(())
    }

    /// Structural invariants that must hold in every persisted state.
    pub fn check_invariants(&self) -> Result<(), ValidationError> {
        if self.recipient.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "recipient".to_string(),
            });
        }
        if self.sender.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "sender".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidValue {
                field: "max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.attempt_count > self.max_attempts {
            return Err(ValidationError::ConstraintViolation {
                constraint: "attempt_count <= max_attempts".to_string(),
                reason: format!("{} > {}", self.attempt_count, self.max_attempts),
            });
        }
        if self.status == MessageStatus::Delivered && self.delivered_at.is_none() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "delivered_at".to_string(),
            });
        }
        if self.dependencies.contains(&self.id) {
            return Err(ValidationError::ConstraintViolation {
                constraint: "dependencies".to_string(),
                reason: "message depends on itself".to_string(),
            });
        }
        Ok(())
    }

    fn expect_status(&self, expected: MessageStatus, to: MessageStatus) -> FleetResult<()> {
        if self.status != expected {
            return Err(QueueError::IllegalTransition {
                message_id: self.id,
                from: self.status,
                to,
            }
            .into());
        }
        Ok(())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any run of failures reaches exactly one terminal-bound state within
        /// `max_attempts` attempts and never breaks the attempt invariant.
        #[test]
        fn prop_failures_exhaust_within_budget(max_attempts in 1u32..8) {
            let mut msg = Message::new("a", "b", "c").with_max_attempts(max_attempts);
            let mut attempts = 0;
            while msg.status == MessageStatus::Queued {
                msg.begin_attempt().unwrap();
                attempts += 1;
                msg.record_failure("x", Utc::now()).unwrap();
                prop_assert!(msg.check_invariants().is_ok());
            }
            prop_assert_eq!(msg.status, MessageStatus::Failed);
            prop_assert_eq!(attempts, max_attempts);
            prop_assert_eq!(msg.attempt_count, max_attempts);
        }
    }
}
