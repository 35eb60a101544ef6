//! Agent endpoint registry.
//!
//! Loaded once at startup and immutable afterwards. An endpoint whose
//! locator falls outside the screen envelope is rejected at load time; the
//! rejection is remembered so traffic for that agent fails with the real
//! reason instead of `UnknownAgent`. Other agents are unaffected.

use fleet_core::{
    AgentEndpoint, AgentId, FleetResult, Locator, RegistryError, ScreenBounds, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// On-disk registry shape: `{ "agents": [ <AgentEndpoint>, ... ] }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub agents: Vec<AgentEndpoint>,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    bounds: ScreenBounds,
    endpoints: BTreeMap<AgentId, AgentEndpoint>,
    rejected: BTreeMap<AgentId, RegistryError>,
}

impl AgentRegistry {
    /// Build from a list of endpoints. Invalid and duplicate entries are
    /// dropped and recorded; the first entry for an id wins.
    pub fn from_endpoints(endpoints: Vec<AgentEndpoint>, bounds: ScreenBounds) -> Self {
        let mut registry = Self {
            bounds,
            endpoints: BTreeMap::new(),
            rejected: BTreeMap::new(),
        };

        for endpoint in endpoints {
            if registry.endpoints.contains_key(&endpoint.agent_id) {
                tracing::warn!(agent_id = %endpoint.agent_id, "duplicate registry entry ignored");
                registry.rejected.insert(
                    endpoint.agent_id.clone(),
                    RegistryError::DuplicateAgent {
                        agent_id: endpoint.agent_id.clone(),
                    },
                );
                continue;
            }
            match registry.validate(&endpoint) {
                Ok(()) => {
                    registry
                        .endpoints
                        .insert(endpoint.agent_id.clone(), endpoint);
                }
                Err(e) => {
                    tracing::warn!(agent_id = %endpoint.agent_id, error = %e, "registry entry rejected");
                    registry.rejected.insert(endpoint.agent_id.clone(), e);
                }
            }
        }

        tracing::info!(
            agents = registry.endpoints.len(),
            rejected = registry.rejected.len(),
            "agent registry loaded"
        );
        registry
    }

    /// Load a JSON registry file.
    pub fn load(path: &Path, bounds: ScreenBounds) -> FleetResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
        let file: RegistryFile =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::parse(path, e))?;
        Ok(Self::from_endpoints(file.agents, bounds))
    }

    /// Check one endpoint against the screen envelope.
    pub fn validate(&self, endpoint: &AgentEndpoint) -> Result<(), RegistryError> {
        let target = endpoint.injection_target;
        if !self.bounds.contains(&target) {
            return Err(RegistryError::InvalidLocator {
                agent_id: endpoint.agent_id.clone(),
                x: target.x,
                y: target.y,
            });
        }
        Ok(())
    }

    pub fn resolve(&self, agent_id: &str) -> Result<&AgentEndpoint, RegistryError> {
        if let Some(endpoint) = self.endpoints.get(agent_id) {
            return Ok(endpoint);
        }
        Err(self
            .rejected
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| RegistryError::UnknownAgent {
                agent_id: agent_id.to_string(),
            }))
    }

    /// The agent whose input area is at `locator`, if any.
    pub fn locate(&self, locator: Locator) -> Option<&AgentEndpoint> {
        self.endpoints
            .values()
            .find(|e| e.injection_target == locator)
    }

    /// Valid endpoints, ordered by agent id.
    pub fn endpoints(&self) -> impl Iterator<Item = &AgentEndpoint> {
        self.endpoints.values()
    }

    pub fn rejected(&self) -> &BTreeMap<AgentId, RegistryError> {
        &self.rejected
    }

    pub fn bounds(&self) -> ScreenBounds {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str, x: i32, y: i32) -> AgentEndpoint {
        AgentEndpoint::new(id, Locator::new(x, y), format!("inboxes/{id}"))
    }

    #[test]
    fn test_resolve_known_agent() {
        let registry = AgentRegistry::from_endpoints(
            vec![endpoint("Agent-1", -1269, 481), endpoint("Agent-2", 652, 421)],
            ScreenBounds::default(),
        );
        assert_eq!(registry.len(), 2);
        let agent = registry.resolve("Agent-2").unwrap();
        assert_eq!(agent.injection_target, Locator::new(652, 421));
        assert_eq!(
            registry.locate(Locator::new(-1269, 481)).unwrap().agent_id,
            "Agent-1"
        );
        assert!(registry.locate(Locator::new(0, 0)).is_none());
    }

    #[test]
    fn test_unknown_agent() {
        let registry = AgentRegistry::from_endpoints(vec![], ScreenBounds::default());
        assert_eq!(
            registry.resolve("Agent-7"),
            Err(RegistryError::UnknownAgent {
                agent_id: "Agent-7".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_locator_rejected_at_load() {
        let registry = AgentRegistry::from_endpoints(
            vec![endpoint("Agent-1", 10, 10), endpoint("Agent-8", 9000, 10)],
            ScreenBounds::default(),
        );
        assert!(registry.resolve("Agent-1").is_ok());
        assert!(matches!(
            registry.resolve("Agent-8"),
            Err(RegistryError::InvalidLocator { x: 9000, .. })
        ));
        assert_eq!(registry.rejected().len(), 1);
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let registry = AgentRegistry::from_endpoints(
            vec![endpoint("Agent-1", 10, 10), endpoint("Agent-1", 20, 20)],
            ScreenBounds::default(),
        );
        assert_eq!(
            registry.resolve("Agent-1").unwrap().injection_target,
            Locator::new(10, 10)
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        std::fs::write(
            &path,
            r#"{"agents": [
                {"agent_id": "Agent-1", "injection_target": {"x": 100, "y": 200}, "inbox_path": "inboxes/Agent-1"}
            ]}"#,
        )
        .unwrap();
        let registry = AgentRegistry::load(&path, ScreenBounds::default()).unwrap();
        assert_eq!(registry.resolve("Agent-1").unwrap().inbox_path, Path::new("inboxes/Agent-1"));
    }
}
