//! Fleet Core - Entity Types
//!
//! Data structures shared by every fleet crate: identifiers, status enums,
//! the message and contract entities, agent endpoints, health results,
//! configuration and the error taxonomy. Nothing here touches the filesystem
//! except `FleetConfig::load`.

pub mod agent;
pub mod config;
pub mod contract;
pub mod enums;
pub mod error;
pub mod health;
pub mod identity;
pub mod message;

pub use agent::{AgentEndpoint, Locator, ScreenBounds, StatusSnapshot};
pub use config::{
    BackoffPolicy, ContractsConfig, DeliveryConfig, FleetConfig, MonitorConfig, PathsConfig,
    QueueConfig,
};
pub use contract::{Contract, ContractCategory, ContractDocument};
pub use enums::{ContractStatus, MessagePriority, MessageStatus, StatusParseError};
pub use error::{
    ConfigError, ContractError, DeliveryError, FleetError, FleetResult, QueueError, RegistryError,
    StoreError, ValidationError,
};
pub use health::{AgentHealth, FleetHealth, HealthClass};
pub use identity::{
    compute_content_hash, fingerprint, new_message_id, AgentId, ContentHash, ContractId, MessageId,
    Timestamp,
};
pub use message::{Message, DEFAULT_MAX_ATTEMPTS};
