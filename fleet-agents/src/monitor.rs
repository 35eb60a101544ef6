//! Staleness classification over agent status snapshots.

use fleet_core::{AgentHealth, FleetHealth, HealthClass, MonitorConfig, StatusSnapshot, Timestamp};
use std::time::Duration;

/// Classifies snapshots by age. Both thresholds are inclusive: an age equal
/// to `healthy_within` is still healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMonitor {
    healthy_within: chrono::Duration,
    stale_within: chrono::Duration,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

impl StatusMonitor {
    pub fn new(healthy_within: Duration, stale_within: Duration) -> Self {
        Self {
            healthy_within: to_chrono(healthy_within),
            stale_within: to_chrono(stale_within.max(healthy_within)),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.healthy_within, config.stale_within)
    }

    /// A snapshot dated in the future counts as fresh.
    pub fn classify(&self, snapshot: &StatusSnapshot, now: Timestamp) -> HealthClass {
        let age = now - snapshot.last_updated;
        if age <= self.healthy_within {
            HealthClass::Healthy
        } else if age <= self.stale_within {
            HealthClass::Stale
        } else {
            HealthClass::Critical
        }
    }

    pub fn assess(&self, snapshot: &StatusSnapshot, now: Timestamp) -> AgentHealth {
        AgentHealth {
            agent_id: snapshot.agent_id.clone(),
            class: self.classify(snapshot, now),
            age_secs: (now - snapshot.last_updated).num_seconds(),
            status: snapshot.status.clone(),
        }
    }

    /// Fraction of healthy agents, `1.0` when there are none.
    pub fn fleet_health(&self, snapshots: &[StatusSnapshot], now: Timestamp) -> f64 {
        self.report(snapshots, now).score
    }

    /// Per-agent classes plus the aggregate.
    pub fn report(&self, snapshots: &[StatusSnapshot], now: Timestamp) -> FleetHealth {
        let agents: Vec<AgentHealth> = snapshots.iter().map(|s| self.assess(s, now)).collect();
        let report = FleetHealth::from_agents(agents);
        for agent in report.agents.iter().filter(|a| a.class == HealthClass::Critical) {
            tracing::warn!(agent_id = %agent.agent_id, age_secs = agent.age_secs, "agent status is critical");
        }
        report
    }
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}
