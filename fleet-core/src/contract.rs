//! Contract entity and the shared contract document.
//!
//! The document shape is fixed by the external seeding process:
//!
//! ```text
//! { "contracts": { "<category>": { "contracts": [ <Contract>, ... ] } } }
//! ```
//!
//! Unknown keys at every level are preserved through `extra` so a rewrite
//! never drops data another tool put there.

use crate::{AgentId, ContractId, ContractStatus, Timestamp};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A claimable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: ContractId,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub points: i64,
    pub status: ContractStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverables: Option<Vec<String>>,
    #[serde(default)]
    pub progress: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Contract {
    /// Create an available contract (what the seeding process produces).
    pub fn available(contract_id: &str, category: &str, title: &str, points: i64) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            category: category.to_string(),
            title: title.to_string(),
            description: String::new(),
            points,
            status: ContractStatus::Available,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            deliverables: None,
            progress: "0%".to_string(),
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// The `Claimed` successor of this record. Does not check legality;
    /// callers run the validator on the result.
    pub fn claimed(&self, agent_id: &str, at: Timestamp) -> Self {
        let mut next = self.clone();
        next.status = ContractStatus::Claimed;
        next.claimed_by = Some(agent_id.to_string());
        next.claimed_at = Some(at);
        next.completed_at = None;
        next.deliverables = None;
        next.progress = "0%".to_string();
        next
    }

    /// The `Completed` successor of this record.
    pub fn completed(&self, deliverables: Vec<String>, at: Timestamp) -> Self {
        let mut next = self.clone();
        next.status = ContractStatus::Completed;
        next.completed_at = Some(at);
        next.deliverables = Some(deliverables);
        next.progress = "100%".to_string();
        next
    }

    pub fn is_claimed_by(&self, agent_id: &str) -> bool {
        self.status == ContractStatus::Claimed && self.claimed_by.as_deref() == Some(agent_id)
    }
}

/// One category block of the contract document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractCategory {
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The whole contract store document (single source of truth). Categories
/// keep their file order across rewrites.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractDocument {
    #[serde(default)]
    pub contracts: IndexMap<String, ContractCategory>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContractDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contract under its category. Seeding/test helper; does not
    /// check uniqueness.
    pub fn insert(&mut self, contract: Contract) {
        self.contracts
            .entry(contract.category.clone())
            .or_default()
            .contracts
            .push(contract);
    }

    /// Iterate every contract in document order.
    pub fn iter(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values().flat_map(|c| c.contracts.iter())
    }

    /// First contract with the given id.
    pub fn find(&self, contract_id: &str) -> Option<&Contract> {
        self.iter().find(|c| c.contract_id == contract_id)
    }

    pub fn find_mut(&mut self, contract_id: &str) -> Option<&mut Contract> {
        self.contracts
            .values_mut()
            .flat_map(|c| c.contracts.iter_mut())
            .find(|c| c.contract_id == contract_id)
    }

    /// Replace the first contract with a matching id. Returns false if absent.
    pub fn replace(&mut self, contract: Contract) -> bool {
        match self.find_mut(&contract.contract_id) {
            Some(slot) => {
                *slot = contract;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.contracts.values().map(|c| c.contracts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
