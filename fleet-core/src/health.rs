//! Health classification types
//!
//! Shared by the status monitor and the CLI so that both report the same
//! shape.

use crate::AgentId;
use serde::{Deserialize, Serialize};

/// Staleness class of one agent's status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthClass {
    /// Updated within the healthy window
    Healthy,
    /// Older than the healthy window but within the stale window
    Stale,
    /// Older than the stale window
    Critical,
}

impl HealthClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthClass::Healthy => "healthy",
            HealthClass::Stale => "stale",
            HealthClass::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub class: HealthClass,
    /// Seconds since the snapshot was last updated (negative if in the future)
    pub age_secs: i64,
    /// Operational label copied from the snapshot
    pub status: String,
}

/// Aggregate over the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetHealth {
    /// Fraction of healthy agents in `[0.0, 1.0]`; `1.0` for an empty fleet
    pub score: f64,
    pub healthy: usize,
    pub stale: usize,
    pub critical: usize,
    pub agents: Vec<AgentHealth>,
}

impl FleetHealth {
    /// Build the aggregate from per-agent results.
    pub fn from_agents(agents: Vec<AgentHealth>) -> Self {
        let count = |class| agents.iter().filter(|a| a.class == class).count();
        let healthy = count(HealthClass::Healthy);
        let stale = count(HealthClass::Stale);
        let critical = count(HealthClass::Critical);
        let score = if agents.is_empty() {
            1.0
        } else {
            healthy as f64 / agents.len() as f64
        };
        Self {
            score,
            healthy,
            stale,
            critical,
            agents,
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "fleet health {:.0}% ({} healthy, {} stale, {} critical)",
            self.score * 100.0,
            self.healthy,
            self.stale,
            self.critical
        )
    }
}
