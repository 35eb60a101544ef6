//! Fleet Agents - Coordination Services
//!
//! Services built on the fleet-core entities and fleet-storage documents:
//! - Agent registry (endpoint lookup and locator checks)
//! - Serialized delivery through the single input device
//! - Outbound queue processing with inbox verification and dead letters
//! - Contract claiming and completion over compare-and-swap writes
//! - Contract validation and read-only corruption scans
//! - Staleness classification of agent status snapshots

pub mod contracts;
pub mod corruption;
pub mod delivery;
pub mod devices;
pub mod monitor;
pub mod processor;
pub mod registry;
pub mod validator;

pub use contracts::{AgentContractStats, CategoryStats, ContractManager, ContractStats};
pub use corruption::{CorruptionDetector, CorruptionReport, Finding, FindingKind};
pub use delivery::{
    frame_payload, parse_payload, shared_device, Cleared, DeliveryAdapter, DeliveryReceipt,
    Focused, FramedPayload, Injection, InjectionState, InputDevice, SharedInputDevice, Unfocused,
};
pub use devices::InboxDropDevice;
pub use monitor::StatusMonitor;
pub use processor::{AttemptOutcome, MessageQueueProcessor, ProcessSummary};
pub use registry::{AgentRegistry, RegistryFile};
pub use validator::{ContractValidator, Severity, Violation, ViolationKind};
