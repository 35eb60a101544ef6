//! Fleet Test Utilities
//!
//! Shared test infrastructure for the fleet workspace:
//! - Scripted input devices for driving the delivery pipeline
//! - Proptest generators for entity types
//! - A temp-directory harness wiring real file-backed stores together
//! - Custom assertions for fleet error variants

pub use fleet_core::{
    AgentEndpoint, AgentId, BackoffPolicy, Contract, ContractDocument, ContractError,
    ContractStatus, DeliveryError, FleetConfig, FleetError, FleetResult, Locator, Message,
    MessageId, MessageStatus, ScreenBounds, StatusSnapshot, Timestamp,
};

use async_trait::async_trait;
use fleet_agents::{InboxDropDevice, InputDevice};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// INPUT DEVICES
// ============================================================================

/// What a [`ScriptedDevice`] does on its next injection.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Drop the message into the focused inbox
    Deliver,
    /// Report an error
    Fail(String),
    /// Block for the given time, then deliver
    Hang(Duration),
    /// Report success without leaving anything in the inbox
    Silent,
}

/// Device that follows a script, then delivers normally once the script
/// runs out. Every call is recorded.
pub struct ScriptedDevice {
    inner: InboxDropDevice,
    script: VecDeque<Step>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedDevice {
    pub fn new(inner: InboxDropDevice, script: Vec<Step>) -> Self {
        Self {
            inner,
            script: script.into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle onto the call log that stays valid after the device is moved.
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl InputDevice for ScriptedDevice {
    async fn focus(&mut self, target: Locator) -> FleetResult<()> {
        self.record(format!("focus {},{}", target.x, target.y));
        self.inner.focus(target).await
    }

    async fn clear(&mut self) -> FleetResult<()> {
        self.record("clear".to_string());
        self.inner.clear().await
    }

    async fn inject(&mut self, text: &str) -> FleetResult<()> {
        self.record(format!("inject {text}"));
        match self.script.pop_front().unwrap_or(Step::Deliver) {
            Step::Deliver => self.inner.inject(text).await,
            Step::Fail(reason) => Err(DeliveryError::Failed { reason }.into()),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                self.inner.inject(text).await
            }
            Step::Silent => Ok(()),
        }
    }
}

/// Device that reports success for everything and writes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentDevice;

#[async_trait]
impl InputDevice for SilentDevice {
    async fn focus(&mut self, _target: Locator) -> FleetResult<()> {
        Ok(())
    }

    async fn clear(&mut self) -> FleetResult<()> {
        Ok(())
    }

    async fn inject(&mut self, _text: &str) -> FleetResult<()> {
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for fleet entity types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    pub fn arb_agent_id() -> impl Strategy<Value = AgentId> {
        (1u32..=12).prop_map(|n| format!("Agent-{n}"))
    }

    pub fn arb_contract_id() -> impl Strategy<Value = String> {
        (1u32..10_000).prop_map(|n| format!("C-{n}"))
    }

    /// Timestamps between 2024-01-01 and roughly 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_704_067_200i64..1_900_000_000i64)
            .prop_map(|secs| Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now))
    }

    pub fn arb_locator(bounds: ScreenBounds) -> impl Strategy<Value = Locator> {
        (bounds.min_x..=bounds.max_x, bounds.min_y..=bounds.max_y)
            .prop_map(|(x, y)| Locator::new(x, y))
    }

    /// Well-formed contracts in any lifecycle state.
    pub fn arb_contract() -> impl Strategy<Value = Contract> {
        (
            arb_contract_id(),
            prop::sample::select(vec!["testing", "docs", "refactor", "ops"]),
            "[A-Z][A-Za-z ]{0,29}",
            0i64..1000,
            0u8..3,
            arb_agent_id(),
            arb_timestamp(),
            prop::collection::vec("[a-z_]{1,12}\\.md", 1..4),
        )
            .prop_map(|(id, category, title, points, stage, agent, at, deliverables)| {
                let contract = Contract::available(&id, category, &title, points);
                match stage {
                    0 => contract,
                    1 => contract.claimed(&agent, at),
                    _ => contract
                        .claimed(&agent, at)
                        .completed(deliverables, at + chrono::Duration::hours(1)),
                }
            })
    }

    pub fn arb_message() -> impl Strategy<Value = Message> {
        (arb_agent_id(), arb_agent_id(), "[ -~]{0,80}", 1u32..=5)
            .prop_map(|(sender, recipient, content, max_attempts)| {
                Message::new(&sender, &recipient, &content).with_max_attempts(max_attempts)
            })
    }

    pub fn arb_backoff_policy() -> impl Strategy<Value = BackoffPolicy> {
        prop_oneof![
            prop::collection::vec(1u64..60_000, 1..5).prop_map(|ms| BackoffPolicy::schedule(
                ms.into_iter().map(Duration::from_millis).collect(),
                Duration::from_secs(300)
            )),
            (1u64..10_000, 1.0f64..4.0).prop_map(|(ms, mult)| BackoffPolicy::exponential(
                Duration::from_millis(ms),
                mult,
                Duration::from_secs(300)
            )),
        ]
    }

    pub fn arb_snapshot() -> impl Strategy<Value = StatusSnapshot> {
        (
            arb_agent_id(),
            prop::sample::select(vec!["ACTIVE", "IDLE", "BLOCKED"]),
            arb_timestamp(),
        )
            .prop_map(|(agent, status, at)| StatusSnapshot::new(&agent, status, at))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores and records for common scenarios.

    use super::*;
    use fleet_agents::{
        shared_device, AgentRegistry, ContractManager, DeliveryAdapter, MessageQueueProcessor,
    };
    use fleet_storage::{
        DeadLetterDocument, DirInboxStore, DocumentStore, InboxStore, JsonFileStore,
        OutboundQueue, QueueDocument, StatusDocument, StatusStore,
    };
    use tempfile::TempDir;

    /// Agents `Agent-1..=Agent-n`, 200px apart on the primary screen.
    pub fn endpoints(n: usize, inbox_root: &std::path::Path) -> Vec<AgentEndpoint> {
        (1..=n)
            .map(|i| {
                let id = format!("Agent-{i}");
                AgentEndpoint::new(&id, Locator::new(100 + 200 * (i as i32 - 1), 500), inbox_root.join(&id))
            })
            .collect()
    }

    /// `C-100`, available, 100 points.
    pub fn available_contract() -> Contract {
        Contract::available("C-100", "testing", "Write integration tests", 100)
    }

    /// A small board: two available, one claimed, one completed.
    pub fn contract_board() -> ContractDocument {
        let now = chrono::Utc::now();
        let mut doc = ContractDocument::new();
        doc.insert(available_contract());
        doc.insert(Contract::available("C-200", "docs", "Document the queue", 50));
        doc.insert(
            Contract::available("C-300", "refactor", "Split the monitor", 75).claimed("Agent-2", now),
        );
        doc.insert(
            Contract::available("C-400", "testing", "Fuzz the parser", 120)
                .claimed("Agent-1", now)
                .completed(vec!["fuzz.md".to_string()], now),
        );
        doc
    }

    /// Config whose every path lives inside `root`, with fast timings.
    pub fn fleet_config(root: &std::path::Path) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.paths.contracts = root.join("contracts.json");
        config.paths.status = root.join("status.json");
        config.paths.queue = root.join("queue.json");
        config.paths.dead_letters = root.join("dead_letters.json");
        config.paths.registry = root.join("agents.json");
        config.paths.inbox_root = root.join("inboxes");
        config.delivery.timeout = Duration::from_millis(500);
        config.delivery.verification_timeout = Duration::from_millis(100);
        config.delivery.verification_poll_interval = Duration::from_millis(10);
        config
    }

    /// File-backed stores in a temp directory, wired the way the CLI wires
    /// them.
    pub struct FleetHarness {
        pub dir: TempDir,
        pub config: FleetConfig,
        pub registry: Arc<AgentRegistry>,
        pub inbox: Arc<DirInboxStore>,
        pub queue: OutboundQueue,
        pub contracts: Arc<JsonFileStore<ContractDocument>>,
        pub status: StatusStore,
    }

    impl FleetHarness {
        pub fn new(agents: usize) -> FleetResult<Self> {
            let dir = TempDir::new().map_err(|e| fleet_core::StoreError::io("tempdir", e))?;
            let config = fleet_config(dir.path());
            let registry = Arc::new(AgentRegistry::from_endpoints(
                endpoints(agents, &config.paths.inbox_root),
                config.screen,
            ));
            let inbox = Arc::new(DirInboxStore::new(&config.paths.inbox_root));
            let queue = OutboundQueue::new(
                Arc::new(JsonFileStore::<QueueDocument>::new(&config.paths.queue)),
                Arc::new(JsonFileStore::<DeadLetterDocument>::new(&config.paths.dead_letters)),
            );
            let contracts = Arc::new(JsonFileStore::new(&config.paths.contracts));
            let status = StatusStore::new(Arc::new(JsonFileStore::<StatusDocument>::new(&config.paths.status)));
            Ok(Self {
                dir,
                config,
                registry,
                inbox,
                queue,
                contracts,
                status,
            })
        }

        /// Overwrite the contract document.
        pub fn seed_contracts(&self, doc: &ContractDocument) -> FleetResult<()> {
            let current = self.contracts.load()?;
            self.contracts.compare_and_swap(&current.revision, doc)?;
            Ok(())
        }

        pub fn contract_manager(&self) -> ContractManager {
            ContractManager::new(self.contracts.clone())
                .with_max_retries(self.config.contracts.max_cas_retries)
        }

        pub fn drop_device(&self) -> InboxDropDevice {
            InboxDropDevice::new(self.registry.clone(), self.inbox.clone())
        }

        pub fn scripted_device(&self, script: Vec<Step>) -> ScriptedDevice {
            ScriptedDevice::new(self.drop_device(), script)
        }

        /// Processor over this harness with a one-millisecond backoff.
        pub fn processor(&self, device: impl InputDevice + 'static) -> MessageQueueProcessor {
            let inbox: Arc<dyn InboxStore> = self.inbox.clone();
            MessageQueueProcessor::new(
                self.queue.clone(),
                self.registry.clone(),
                DeliveryAdapter::new(shared_device(device), self.config.delivery.timeout),
                inbox,
            )
            .with_backoff(BackoffPolicy::schedule(
                vec![Duration::from_millis(1)],
                Duration::from_millis(1),
            ))
            .with_verification(
                self.config.delivery.verification_timeout,
                self.config.delivery.verification_poll_interval,
            )
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on fleet error variants.

    use super::*;

    #[track_caller]
    pub fn assert_not_available<T: std::fmt::Debug>(result: &FleetResult<T>) {
        match result {
            Err(FleetError::Contract(ContractError::NotAvailable { .. })) => {}
            other => panic!("Expected NotAvailable, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_claimed_by_you<T: std::fmt::Debug>(result: &FleetResult<T>) {
        match result {
            Err(FleetError::Contract(ContractError::NotClaimedByYou { .. })) => {}
            other => panic!("Expected NotClaimedByYou, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_delivery_error<T: std::fmt::Debug>(result: &FleetResult<T>) {
        match result {
            Err(FleetError::Delivery(_)) => {}
            other => panic!("Expected Delivery error, got: {:?}", other),
        }
    }

    /// Every message is terminal and none is stuck mid-attempt.
    #[track_caller]
    pub fn assert_all_terminal(messages: &[Message]) {
        for m in messages {
            assert!(
                m.is_terminal(),
                "message {} left in {} after {} attempts",
                m.id,
                m.status,
                m.attempt_count
            );
        }
    }
}
