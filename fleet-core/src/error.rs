//! Error types for fleet operations

use crate::{ContractStatus, MessageId, MessageStatus};
use thiserror::Error;

/// Document and mailbox storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Revision mismatch: expected {expected}, found {found}")]
    RevisionMismatch { expected: String, found: String },

    #[error("Timed out waiting for lock on {path}")]
    LockTimeout { path: String },

    #[error("Entry already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Entry not found: {id}")]
    NotFound { id: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Build an `Io` variant from a std error and the path it concerns.
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Build a `Parse` variant from any displayable error.
    pub fn parse(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        StoreError::Parse {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Validation errors. Raised before anything reaches a store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },

    #[error("Illegal transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Stale snapshot for {agent_id}: {incoming} is older than {stored}")]
    StaleSnapshot {
        agent_id: String,
        incoming: String,
        stored: String,
    },
}

/// Contract claiming errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("Contract not found: {contract_id}")]
    NotFound { contract_id: String },

    #[error("Contract {contract_id} is not available (status: {status})")]
    NotAvailable {
        contract_id: String,
        status: ContractStatus,
    },

    #[error("Contract {contract_id} is not claimed by {agent_id}")]
    NotClaimedByYou {
        contract_id: String,
        agent_id: String,
    },

    #[error("Contract {contract_id} cannot be completed without deliverables")]
    EmptyDeliverables { contract_id: String },

    #[error("Contract {contract_id} write conflict after {attempts} attempts")]
    Conflict { contract_id: String, attempts: u32 },
}

/// Delivery pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Delivery exceeded its {budget_ms}ms budget")]
    Timeout { budget_ms: u64 },

    #[error("Delivery failed: {reason}")]
    Failed { reason: String },

    #[error("No inbox artifact for message {message_id} after {waited_ms}ms")]
    VerificationFailed { message_id: MessageId, waited_ms: u64 },
}

/// Agent registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("Locator ({x}, {y}) for {agent_id} is outside the screen bounds")]
    InvalidLocator { agent_id: String, x: i32, y: i32 },

    #[error("Agent registered twice: {agent_id}")]
    DuplicateAgent { agent_id: String },
}

/// Outbound queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Message not in queue: {message_id}")]
    UnknownMessage { message_id: MessageId },

    #[error("Message already queued: {message_id}")]
    DuplicateMessage { message_id: MessageId },

    #[error("Message {message_id} cannot move from {from} to {to}")]
    IllegalTransition {
        message_id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read configuration {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Master error type for all fleet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl FleetError {
    /// Whether the delivery pipeline should retry after this error.
    pub fn is_retryable_delivery(&self) -> bool {
        matches!(self, FleetError::Delivery(_))
    }
}

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_contract_error_display_not_available() {
        let err = ContractError::NotAvailable {
            contract_id: "C-100".to_string(),
            status: ContractStatus::Claimed,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("C-100"));
        assert!(msg.contains("claimed"));
    }

    #[test]
    fn test_delivery_error_display_verification() {
        let err = DeliveryError::VerificationFailed {
            message_id: Uuid::nil(),
            waited_ms: 1500,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("No inbox artifact"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn test_registry_error_display_invalid_locator() {
        let err = RegistryError::InvalidLocator {
            agent_id: "Agent-7".to_string(),
            x: -5000,
            y: 20,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Agent-7"));
        assert!(msg.contains("-5000"));
    }

    #[test]
    fn test_store_error_io_helper() {
        let err = StoreError::io(
            "/tmp/contracts.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        let msg = format!("{}", err);
        assert!(msg.contains("/tmp/contracts.json"));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn test_fleet_error_from_conversions() {
        let err: FleetError = ContractError::EmptyDeliverables {
            contract_id: "C-1".to_string(),
        }
        .into();
        assert!(matches!(err, FleetError::Contract(_)));
        assert!(!err.is_retryable_delivery());

        let err: FleetError = DeliveryError::Timeout { budget_ms: 30_000 }.into();
        assert!(err.is_retryable_delivery());
        assert!(format!("{}", err).contains("Delivery error"));
    }
}
