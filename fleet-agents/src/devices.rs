//! Input devices that ship with the crate.

use crate::delivery::{parse_payload, InputDevice};
use crate::registry::AgentRegistry;
use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{AgentId, DeliveryError, FleetResult, Locator};
use fleet_storage::{InboxEnvelope, InboxStore};
use std::sync::Arc;

/// Headless device: "typing" into a session drops the framed message into
/// that agent's inbox. Used by the CLI when no desktop automation backend is
/// wired in, and by tests that need real inbox artifacts.
pub struct InboxDropDevice {
    registry: Arc<AgentRegistry>,
    inbox: Arc<dyn InboxStore>,
    focused: Option<AgentId>,
}

impl InboxDropDevice {
    pub fn new(registry: Arc<AgentRegistry>, inbox: Arc<dyn InboxStore>) -> Self {
        Self {
            registry,
            inbox,
            focused: None,
        }
    }

    fn focused(&self) -> FleetResult<&str> {
        self.focused.as_deref().ok_or_else(|| {
            DeliveryError::Failed {
                reason: "no session focused".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl InputDevice for InboxDropDevice {
    async fn focus(&mut self, target: Locator) -> FleetResult<()> {
        match self.registry.locate(target) {
            Some(endpoint) => {
                self.focused = Some(endpoint.agent_id.clone());
                Ok(())
            }
            None => {
                self.focused = None;
                Err(DeliveryError::Failed {
                    reason: format!("no session at ({}, {})", target.x, target.y),
                }
                .into())
            }
        }
    }

    async fn clear(&mut self) -> FleetResult<()> {
        self.focused().map(|_| ())
    }

    async fn inject(&mut self, text: &str) -> FleetResult<()> {
        let recipient = self.focused()?.to_string();
        let payload = parse_payload(text).ok_or_else(|| DeliveryError::Failed {
            reason: "payload has no message header".to_string(),
        })?;
        let envelope = InboxEnvelope::new(
            payload.message_id,
            &payload.sender,
            &recipient,
            &payload.content,
            Utc::now(),
        );
        if !self.inbox.append(&recipient, &envelope)? {
            tracing::debug!(message_id = %payload.message_id, recipient = %recipient, "envelope already present");
        }
        Ok(())
    }
}

impl std::fmt::Debug for InboxDropDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxDropDevice")
            .field("focused", &self.focused)
            .finish_non_exhaustive()
    }
}
