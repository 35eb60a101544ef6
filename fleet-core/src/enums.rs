//! Enum types for fleet entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// MESSAGE STATUS
// ============================================================================

/// Lifecycle state of an outbound message.
///
/// ```text
/// Queued ──→ Delivering ──→ Delivered
///   ↑            │
///   └── retry ───┤
///                └──→ Failed ──→ Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageStatus {
    /// Waiting for (re)delivery
    #[default]
    Queued,
    /// A delivery attempt is in flight
    Delivering,
    /// Delivered and confirmed by an inbox artifact
    Delivered,
    /// Last allowed attempt failed; about to be dead-lettered
    Failed,
    /// Retry budget exhausted; surfaced to an operator
    Dead,
}

impl MessageStatus {
    /// Convert to stored string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "Queued",
            MessageStatus::Delivering => "Delivering",
            MessageStatus::Delivered => "Delivered",
            MessageStatus::Failed => "Failed",
            MessageStatus::Dead => "Dead",
        }
    }

    /// Parse from stored string representation.
    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(MessageStatus::Queued),
            "delivering" => Ok(MessageStatus::Delivering),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            "dead" => Ok(MessageStatus::Dead),
            _ => Err(StatusParseError::new("message status", s)),
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Dead)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for MessageStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Priority level for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum MessagePriority {
    /// Low priority - can be delayed
    Low,
    /// Normal priority
    #[default]
    Normal,
    /// High priority - should be processed soon
    High,
    /// Urgent - operator escalation
    Urgent,
}

impl MessagePriority {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "Low",
            MessagePriority::Normal => "Normal",
            MessagePriority::High => "High",
            MessagePriority::Urgent => "Urgent",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.to_lowercase().as_str() {
            "low" => Ok(MessagePriority::Low),
            "normal" | "regular" => Ok(MessagePriority::Normal),
            "high" => Ok(MessagePriority::High),
            "urgent" | "critical" => Ok(MessagePriority::Urgent),
            _ => Err(StatusParseError::new("message priority", s)),
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for MessagePriority {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// CONTRACT STATUS
// ============================================================================

/// Three-state contract lifecycle. Stored lowercase in the contract document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    /// Open for claiming
    Available,
    /// Held by exactly one agent
    Claimed,
    /// Finished with deliverables
    Completed,
}

impl ContractStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ContractStatus::Available => "available",
            ContractStatus::Claimed => "claimed",
            ContractStatus::Completed => "completed",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.to_lowercase().as_str() {
            "available" => Ok(ContractStatus::Available),
            "claimed" => Ok(ContractStatus::Claimed),
            "completed" => Ok(ContractStatus::Completed),
            _ => Err(StatusParseError::new("contract status", s)),
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: ContractStatus) -> bool {
        matches!(
            (self, next),
            (ContractStatus::Available, ContractStatus::Claimed)
                | (ContractStatus::Claimed, ContractStatus::Completed)
        )
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ContractStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// PARSE ERROR
// ============================================================================

/// Error when parsing an invalid status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for StatusParseError {}
