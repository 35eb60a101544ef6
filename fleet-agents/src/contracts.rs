//! Contract claiming and completion over the shared contract document.
//!
//! Every mutation is read → validate → compare-and-swap. Losing the swap
//! means another writer got there first; the whole sequence is re-run
//! against the fresh document, up to `max_retries` times.

use crate::ContractValidator;
use chrono::Utc;
use fleet_core::{
    Contract, ContractDocument, ContractError, ContractStatus, FleetError, FleetResult,
    StoreError, ValidationError,
};
use fleet_storage::{DocumentStore, Versioned};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// STATS
// ============================================================================

/// Per-agent contract counts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentContractStats {
    pub claimed: usize,
    pub completed: usize,
    pub points_earned: i64,
}

/// Per-category contract counts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: usize,
    pub available: usize,
    pub claimed: usize,
    pub completed: usize,
}

/// Aggregate view over the whole store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractStats {
    pub total: usize,
    pub available: usize,
    pub claimed: usize,
    pub completed: usize,
    /// `completed / total`, `0.0` for an empty store
    pub completion_rate: f64,
    /// Sum of points over available contracts
    pub points_available: i64,
    /// Sum of points over claimed contracts
    pub points_in_progress: i64,
    /// Sum of points over completed contracts
    pub points_earned: i64,
    pub by_agent: BTreeMap<String, AgentContractStats>,
    pub by_category: BTreeMap<String, CategoryStats>,
}

impl ContractStats {
    pub fn from_document(doc: &ContractDocument) -> Self {
        let mut stats = ContractStats::default();
        for (category, block) in &doc.contracts {
            let cat = stats.by_category.entry(category.clone()).or_default();
            for contract in &block.contracts {
                cat.total += 1;
                stats.total += 1;
                let points = contract.points.max(0);
                match contract.status {
                    ContractStatus::Available => {
                        cat.available += 1;
                        stats.available += 1;
                        stats.points_available += points;
                    }
                    ContractStatus::Claimed => {
                        cat.claimed += 1;
                        stats.claimed += 1;
                        stats.points_in_progress += points;
                    }
                    ContractStatus::Completed => {
                        cat.completed += 1;
                        stats.completed += 1;
                        stats.points_earned += points;
                    }
                }
                if let Some(agent) = &contract.claimed_by {
                    let entry = stats.by_agent.entry(agent.clone()).or_default();
                    match contract.status {
                        ContractStatus::Claimed => entry.claimed += 1,
                        ContractStatus::Completed => {
                            entry.completed += 1;
                            entry.points_earned += points;
                        }
                        ContractStatus::Available => {}
                    }
                }
            }
        }
        if stats.total > 0 {
            stats.completion_rate = stats.completed as f64 / stats.total as f64;
        }
        stats
    }
}

// ============================================================================
// MANAGER
// ============================================================================

#[derive(Clone)]
pub struct ContractManager {
    store: Arc<dyn DocumentStore<ContractDocument>>,
    validator: ContractValidator,
    max_retries: u32,
}

impl ContractManager {
    pub fn new(store: Arc<dyn DocumentStore<ContractDocument>>) -> Self {
        Self {
            store,
            validator: ContractValidator::new(),
            max_retries: 5,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Take an available contract for `agent_id`.
    pub fn claim(&self, contract_id: &str, agent_id: &str) -> FleetResult<Contract> {
        if agent_id.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "agent_id".to_string(),
            }
            .into());
        }
        let claimed = self.transition(contract_id, |current| {
            if current.status != ContractStatus::Available {
                return Err(ContractError::NotAvailable {
                    contract_id: contract_id.to_string(),
                    status: current.status,
                }
                .into());
            }
            Ok(current.claimed(agent_id, Utc::now()))
        })?;
        tracing::info!(contract_id, agent_id, "contract claimed");
        Ok(claimed)
    }

    /// Finish a contract the agent holds.
    pub fn complete(
        &self,
        contract_id: &str,
        agent_id: &str,
        deliverables: Vec<String>,
    ) -> FleetResult<Contract> {
        let deliverables: Vec<String> = deliverables
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        let completed = self.transition(contract_id, |current| {
            if !current.is_claimed_by(agent_id) {
                return Err(ContractError::NotClaimedByYou {
                    contract_id: contract_id.to_string(),
                    agent_id: agent_id.to_string(),
                }
                .into());
            }
            if deliverables.is_empty() {
                return Err(ContractError::EmptyDeliverables {
                    contract_id: contract_id.to_string(),
                }
                .into());
            }
            Ok(current.completed(deliverables.clone(), Utc::now()))
        })?;
        tracing::info!(
            contract_id,
            agent_id,
            deliverables = completed.deliverables.as_ref().map_or(0, Vec::len),
            "contract completed"
        );
        Ok(completed)
    }

    pub fn get(&self, contract_id: &str) -> FleetResult<Contract> {
        self.store
            .load()?
            .value
            .find(contract_id)
            .cloned()
            .ok_or_else(|| {
                ContractError::NotFound {
                    contract_id: contract_id.to_string(),
                }
                .into()
            })
    }

    pub fn list_available(&self) -> FleetResult<Vec<Contract>> {
        self.list_where(|c| c.status == ContractStatus::Available)
    }

    /// Contracts currently claimed or completed by `agent_id`.
    pub fn list_for_agent(&self, agent_id: &str) -> FleetResult<Vec<Contract>> {
        self.list_where(|c| c.claimed_by.as_deref() == Some(agent_id))
    }

    pub fn stats(&self) -> FleetResult<ContractStats> {
        Ok(ContractStats::from_document(&self.store.load()?.value))
    }

    fn list_where(&self, pred: impl Fn(&Contract) -> bool) -> FleetResult<Vec<Contract>> {
        Ok(self
            .store
            .load()?
            .value
            .iter()
            .filter(|c| pred(c))
            .cloned()
            .collect())
    }

    /// Shared read-validate-CAS loop. `next_of` decides the successor record
    /// or rejects the operation; it is re-run on every attempt.
    fn transition(
        &self,
        contract_id: &str,
        next_of: impl Fn(&Contract) -> FleetResult<Contract>,
    ) -> FleetResult<Contract> {
        for attempt in 1..=self.max_retries {
            let Versioned {
                value: mut doc,
                revision,
            } = self.store.load()?;

            let occurrences = doc.iter().filter(|c| c.contract_id == contract_id).count();
            if occurrences > 1 {
                return Err(ValidationError::ConstraintViolation {
                    constraint: "contract_id".to_string(),
                    reason: format!("{contract_id} appears {occurrences} times in the store"),
                }
                .into());
            }
            let current = doc.find(contract_id).cloned().ok_or_else(|| {
                FleetError::from(ContractError::NotFound {
                    contract_id: contract_id.to_string(),
                })
            })?;

            let next = next_of(&current)?;
            self.validator.validate_transition(&current, &next)?;
            doc.replace(next.clone());

            match self.store.compare_and_swap(&revision, &doc) {
                Ok(_) => return Ok(next),
                Err(FleetError::Store(StoreError::RevisionMismatch { .. })) => {
                    tracing::warn!(contract_id, attempt, "contract write conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ContractError::Conflict {
            contract_id: contract_id.to_string(),
            attempts: self.max_retries,
        }
        .into())
    }
}

impl std::fmt::Debug for ContractManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractManager")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
