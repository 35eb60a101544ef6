//! Agent endpoint and status snapshot types.

use crate::{AgentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// INJECTION TARGET
// ============================================================================

/// Screen/session locator of an agent's input area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub x: i32,
    pub y: i32,
}

impl Locator {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Inclusive envelope every locator must fall inside.
///
/// Multi-monitor layouts put secondary screens at negative offsets, so the
/// envelope is given as min/max corners rather than width/height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenBounds {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl ScreenBounds {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn contains(&self, locator: &Locator) -> bool {
        (self.min_x..=self.max_x).contains(&locator.x)
            && (self.min_y..=self.max_y).contains(&locator.y)
    }

    /// Whether the envelope is non-degenerate.
    pub fn is_valid(&self) -> bool {
        self.min_x < self.max_x && self.min_y < self.max_y
    }
}

impl Default for ScreenBounds {
    /// Two 1920x1080 screens side by side, the primary at the origin.
    fn default() -> Self {
        Self::new(-1920, 0, 1919, 1079)
    }
}

/// Where and how to reach one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub agent_id: AgentId,
    pub injection_target: Locator,
    pub inbox_path: PathBuf,
}

impl AgentEndpoint {
    pub fn new(agent_id: &str, injection_target: Locator, inbox_path: impl Into<PathBuf>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            injection_target,
            inbox_path: inbox_path.into(),
        }
    }
}

// ============================================================================
// STATUS SNAPSHOT
// ============================================================================

/// Self-reported operational status of one agent. Overwritten in place by
/// its owner; read-only to the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub agent_id: AgentId,
    /// Free-form operational label ("ACTIVE", "waiting on review", ...)
    #[serde(default)]
    pub status: String,
    pub last_updated: Timestamp,
    #[serde(default)]
    pub current_mission: String,
    #[serde(default)]
    pub current_tasks: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
}

impl StatusSnapshot {
    pub fn new(agent_id: &str, status: &str, last_updated: Timestamp) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: status.to_string(),
            last_updated,
            current_mission: String::new(),
            current_tasks: Vec::new(),
            next_actions: Vec::new(),
        }
    }

    pub fn with_mission(mut self, mission: &str) -> Self {
        self.current_mission = mission.to_string();
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<String>) -> Self {
        self.current_tasks = tasks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_inclusive_edges() {
        let bounds = ScreenBounds::new(0, 0, 100, 50);
        assert!(bounds.contains(&Locator::new(0, 0)));
        assert!(bounds.contains(&Locator::new(100, 50)));
        assert!(!bounds.contains(&Locator::new(101, 50)));
        assert!(!bounds.contains(&Locator::new(-1, 10)));
    }

    #[test]
    fn test_default_bounds_cover_secondary_screen() {
        let bounds = ScreenBounds::default();
        assert!(bounds.is_valid());
        assert!(bounds.contains(&Locator::new(-1269, 481)));
        assert!(bounds.contains(&Locator::new(652, 421)));
        assert!(!bounds.contains(&Locator::new(5000, 0)));
    }

    #[test]
    fn test_degenerate_bounds() {
        assert!(!ScreenBounds::new(10, 0, 10, 100).is_valid());
    }
}
