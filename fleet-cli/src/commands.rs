//! Command handlers. Each builds the stores it needs from the config and
//! prints one line per record (or JSON with `--json`).

use crate::Command;
use chrono::Utc;
use fleet_agents::{
    shared_device, AgentRegistry, ContractManager, CorruptionDetector, DeliveryAdapter,
    InboxDropDevice, MessageQueueProcessor, StatusMonitor,
};
use fleet_core::{
    ContractDocument, DeliveryError, FleetConfig, FleetResult, Message, QueueError,
    StatusSnapshot, StoreError,
};
use fleet_storage::{
    DeadLetterDocument, DirInboxStore, InboxStore, JsonFileStore, OutboundQueue, QueueDocument,
    StatusDocument, StatusStore,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub struct Services {
    config: FleetConfig,
    json: bool,
}

impl Services {
    pub fn new(config: FleetConfig, json: bool) -> Self {
        Self { config, json }
    }

    // ========================================================================
    // WIRING
    // ========================================================================

    fn contract_store(&self) -> Arc<JsonFileStore<ContractDocument>> {
        Arc::new(JsonFileStore::new(&self.config.paths.contracts))
    }

    fn contracts(&self) -> ContractManager {
        ContractManager::new(self.contract_store()).with_max_retries(self.config.contracts.max_cas_retries)
    }

    fn queue(&self) -> OutboundQueue {
        OutboundQueue::new(
            Arc::new(JsonFileStore::<QueueDocument>::new(&self.config.paths.queue)),
            Arc::new(JsonFileStore::<DeadLetterDocument>::new(&self.config.paths.dead_letters)),
        )
    }

    fn status(&self) -> StatusStore {
        StatusStore::new(Arc::new(JsonFileStore::<StatusDocument>::new(&self.config.paths.status)))
    }

    fn registry(&self) -> FleetResult<AgentRegistry> {
        AgentRegistry::load(&self.config.paths.registry, self.config.screen)
    }

    /// Inbox directories default to `<inbox_root>/<agent_id>`; registry
    /// entries may point elsewhere.
    fn inbox(&self, registry: Option<&AgentRegistry>) -> DirInboxStore {
        let mut inbox = DirInboxStore::new(&self.config.paths.inbox_root);
        for endpoint in registry.into_iter().flat_map(|r| r.endpoints()) {
            inbox = inbox.with_inbox(&endpoint.agent_id, &endpoint.inbox_path);
        }
        inbox
    }

    fn processor(&self) -> FleetResult<MessageQueueProcessor> {
        let registry = Arc::new(self.registry()?);
        let inbox: Arc<dyn InboxStore> = Arc::new(self.inbox(Some(registry.as_ref())));
        let device = InboxDropDevice::new(registry.clone(), inbox.clone());
        let delivery = &self.config.delivery;
        Ok(MessageQueueProcessor::new(
            self.queue(),
            registry,
            DeliveryAdapter::new(shared_device(device), delivery.timeout),
            inbox,
        )
        .with_backoff(self.config.backoff.clone())
        .with_verification(delivery.verification_timeout, delivery.verification_poll_interval))
    }

    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> FleetResult<()> {
        if self.json {
            let text = serde_json::to_string_pretty(value).map_err(|e| StoreError::parse("<stdout>", e))?;
            println!("{text}");
        } else {
            println!("{}", human());
        }
        Ok(())
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    pub async fn run(&self, command: Command) -> FleetResult<()> {
        match command {
            Command::Claim { contract_id, agent_id } => {
                let contract = self.contracts().claim(&contract_id, &agent_id)?;
                self.emit(&contract, || format!("claimed {} for {}", contract.contract_id, agent_id))
            }
            Command::Complete {
                contract_id,
                agent_id,
                deliverables,
            } => {
                let contract = self.contracts().complete(&contract_id, &agent_id, deliverables)?;
                self.emit(&contract, || {
                    format!(
                        "completed {} by {} ({} points)",
                        contract.contract_id, agent_id, contract.points
                    )
                })
            }
            Command::ListAvailable => {
                let available = self.contracts().list_available()?;
                self.emit(&available, || {
                    if available.is_empty() {
                        return "no available contracts".to_string();
                    }
                    available
                        .iter()
                        .map(|c| format!("{}\t{}\t{}\t{}", c.contract_id, c.category, c.points, c.title))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            Command::Stats => {
                let stats = self.contracts().stats()?;
                self.emit(&stats, || {
                    format!(
                        "{} contracts: {} available, {} claimed, {} completed ({:.0}% done); points {} earned / {} in progress / {} available",
                        stats.total,
                        stats.available,
                        stats.claimed,
                        stats.completed,
                        stats.completion_rate * 100.0,
                        stats.points_earned,
                        stats.points_in_progress,
                        stats.points_available
                    )
                })
            }
            Command::Send {
                recipient,
                content,
                from,
                category,
                priority,
                max_attempts,
                dependencies,
                tags,
                queue_only,
            } => {
                let message = Message::new(&from, &recipient, &content)
                    .with_category(&category)
                    .with_priority(priority)
                    .with_max_attempts(max_attempts.unwrap_or(self.config.queue.default_max_attempts))
                    .with_dependencies(dependencies)
                    .with_tags(tags);
                self.send(message, queue_only).await
            }
            Command::Process { once } => {
                let processor = self.processor()?;
                let summary = if once {
                    processor.recover_interrupted(Utc::now())?;
                    processor.process_once().await?
                } else {
                    processor.run_until_idle().await?
                };
                self.emit(&summary, || {
                    format!(
                        "{} attempted, {} delivered, {} retried, {} dead-lettered, {} pending",
                        summary.attempted,
                        summary.delivered,
                        summary.retried,
                        summary.dead_lettered,
                        summary.pending
                    )
                })
            }
            Command::DeadLetters => {
                let dead = self.queue().dead_letters()?;
                self.emit(&dead, || {
                    if dead.is_empty() {
                        return "no dead letters".to_string();
                    }
                    dead.iter()
                        .map(|d| {
                            format!(
                                "{}\t{} -> {}\t{}\t{}",
                                d.message.id,
                                d.message.sender,
                                d.message.recipient,
                                d.buried_at.to_rfc3339(),
                                d.reason
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            Command::Inbox { agent_id, all } => {
                let registry = self.registry().map_err(|e| {
                    tracing::debug!(error = %e, "registry unavailable, using default inbox layout");
                    e
                });
                let inbox = self.inbox(registry.as_ref().ok());
                let envelopes = if all {
                    inbox.list_all(&agent_id)?
                } else {
                    inbox.list_pending(&agent_id)?
                };
                self.emit(&envelopes, || {
                    if envelopes.is_empty() {
                        return format!("inbox of {agent_id} is empty");
                    }
                    envelopes
                        .iter()
                        .map(|e| format!("{}\t{}\t{}\t{}", e.id, e.sender, e.received_at.to_rfc3339(), e.content))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            Command::Ack { agent_id, message_id } => {
                let registry = self.registry().ok();
                let inbox = self.inbox(registry.as_ref());
                inbox.mark_processed(&agent_id, message_id)?;
                let envelope = inbox
                    .find(&agent_id, message_id)?
                    .ok_or(QueueError::UnknownMessage { message_id })?;
                self.emit(&envelope, || format!("acknowledged {message_id} for {agent_id}"))
            }
            Command::Scan { output, strict } => self.scan(output.as_deref(), strict),
            Command::Health => {
                let snapshots = self.status().list()?;
                let report = StatusMonitor::from_config(&self.config.monitor).report(&snapshots, Utc::now());
                self.emit(&report, || {
                    let mut lines = vec![report.summary()];
                    lines.extend(report.agents.iter().map(|a| {
                        format!("{}\t{}\t{}s\t{}", a.agent_id, a.class.as_str(), a.age_secs, a.status)
                    }));
                    lines.join("\n")
                })
            }
            Command::StatusSet {
                agent_id,
                status,
                mission,
                tasks,
            } => {
                let mut snapshot = StatusSnapshot::new(&agent_id, &status, Utc::now()).with_tasks(tasks);
                if let Some(mission) = mission {
                    snapshot = snapshot.with_mission(&mission);
                }
                self.status().upsert(&snapshot)?;
                self.emit(&snapshot, || format!("status of {agent_id} set to {status}"))
            }
        }
    }

    async fn send(&self, message: Message, queue_only: bool) -> FleetResult<()> {
        let queue = self.queue();
        let recipient = message.recipient.clone();
        let id = queue.enqueue(message.clone())?;
        if queue_only {
            return self.emit(&message, || format!("queued {id} for {recipient}"));
        }

        self.processor()?.run_until_idle().await?;

        if let Some(record) = queue.delivery(id)? {
            return self.emit(&record, || {
                format!("delivered {id} to {recipient} after {} attempt(s)", record.attempt_count)
            });
        }
        match queue.get(id)? {
            Some(m) => Err(DeliveryError::Failed {
                reason: format!("message {id} is still {} (dependencies unresolved)", m.status),
            }
            .into()),
            None => {
                let reason = queue
                    .dead_letters()?
                    .into_iter()
                    .find(|d| d.message.id == id)
                    .map(|d| d.reason)
                    .unwrap_or_else(|| "removed from queue".to_string());
                Err(DeliveryError::Failed {
                    reason: format!("message {id} dead-lettered: {reason}"),
                }
                .into())
            }
        }
    }

    fn scan(&self, output: Option<&Path>, strict: bool) -> FleetResult<()> {
        let store = self.contract_store();
        let report = CorruptionDetector::default().scan_store(store.as_ref())?;

        if let Some(path) = output {
            let bytes = serde_json::to_vec_pretty(&report).map_err(|e| StoreError::parse(path, e))?;
            std::fs::write(path, bytes).map_err(|e| StoreError::io(path, e))?;
        }
        self.emit(&report, || {
            let mut lines = vec![report.summary()];
            lines.extend(report.findings.iter().map(|f| {
                format!(
                    "{:?}\t{:?}\t{}\t{}",
                    f.severity,
                    f.kind,
                    f.contract_id.as_deref().unwrap_or("-"),
                    f.detail
                )
            }));
            lines.extend(report.suggested_actions.iter().map(|a| format!("suggest: {a}")));
            lines.join("\n")
        })?;

        if strict && report.errors() > 0 {
            return Err(fleet_core::ValidationError::ConstraintViolation {
                constraint: "contract store".to_string(),
                reason: report.summary(),
            }
            .into());
        }
        Ok(())
    }
}
