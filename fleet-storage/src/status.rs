//! Per-agent status snapshots.

use crate::{modify, DocumentStore};
use fleet_core::{AgentId, FleetResult, StatusSnapshot, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `{ "agents": { "<agent_id>": <StatusSnapshot> } }`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default)]
    pub agents: BTreeMap<AgentId, StatusSnapshot>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Snapshot store. Each agent owns its own record; writes are CAS over the
/// whole document with a small retry bound.
#[derive(Clone)]
pub struct StatusStore {
    doc: Arc<dyn DocumentStore<StatusDocument>>,
    max_retries: u32,
}

impl StatusStore {
    pub fn new(doc: Arc<dyn DocumentStore<StatusDocument>>) -> Self {
        Self {
            doc,
            max_retries: 5,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// All snapshots, ordered by agent id.
    pub fn list(&self) -> FleetResult<Vec<StatusSnapshot>> {
        Ok(self.doc.load()?.value.agents.into_values().collect())
    }

    pub fn get(&self, agent_id: &str) -> FleetResult<Option<StatusSnapshot>> {
        Ok(self.doc.load()?.value.agents.remove(agent_id))
    }

    /// Write a snapshot. Rejects one older than what is stored.
    pub fn upsert(&self, snapshot: &StatusSnapshot) -> FleetResult<()> {
        modify(self.doc.as_ref(), self.max_retries, |doc| {
            if let Some(stored) = doc.agents.get(&snapshot.agent_id) {
                if snapshot.last_updated < stored.last_updated {
                    return Err(ValidationError::StaleSnapshot {
                        agent_id: snapshot.agent_id.clone(),
                        incoming: snapshot.last_updated.to_rfc3339(),
                        stored: stored.last_updated.to_rfc3339(),
                    }
                    .into());
                }
            }
            doc.agents
                .insert(snapshot.agent_id.clone(), snapshot.clone());
            Ok(())
        })?;
        tracing::debug!(agent_id = %snapshot.agent_id, status = %snapshot.status, "status snapshot stored");
        Ok(())
    }
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
