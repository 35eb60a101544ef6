//! Per-agent mailboxes.
//!
//! A mailbox holds one envelope per message. Entries are append-once: a
//! second append with the same id is a no-op, which is what makes redelivery
//! after a lost acknowledgement harmless. Processing moves an envelope to the
//! processed set; it is never rewritten.

use fleet_core::{fingerprint, AgentId, FleetResult, MessageId, MessageStatus, StoreError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::NamedTempFile;

const PROCESSED_DIR: &str = "processed";
const ENVELOPE_EXT: &str = "json";

/// The durable record of one delivered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEnvelope {
    pub id: MessageId,
    pub sender: AgentId,
    pub recipient: AgentId,
    pub content: String,
    /// Hex SHA-256 of `content`, checked by delivery verification
    pub fingerprint: String,
    #[serde(default = "delivered")]
    pub status: MessageStatus,
    #[serde(default)]
    pub attempt_count: u32,
    pub received_at: Timestamp,
}

fn delivered() -> MessageStatus {
    MessageStatus::Delivered
}

impl InboxEnvelope {
    pub fn new(
        id: MessageId,
        sender: &str,
        recipient: &str,
        content: &str,
        received_at: Timestamp,
    ) -> Self {
        Self {
            id,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            fingerprint: fingerprint(content.as_bytes()),
            status: MessageStatus::Delivered,
            attempt_count: 0,
            received_at,
        }
    }

    /// Whether this envelope is proof that `content` arrived intact.
    pub fn matches(&self, id: MessageId, content_fingerprint: &str) -> bool {
        self.id == id && self.fingerprint == content_fingerprint
    }
}

/// Mailbox storage keyed by agent.
pub trait InboxStore: Send + Sync {
    /// Add an envelope. Returns `false` if one with the same id already
    /// exists (pending or processed) and nothing was written.
    fn append(&self, agent_id: &str, envelope: &InboxEnvelope) -> FleetResult<bool>;

    /// Unprocessed envelopes, oldest first.
    fn list_pending(&self, agent_id: &str) -> FleetResult<Vec<InboxEnvelope>>;

    /// Every envelope, pending and processed, oldest first.
    fn list_all(&self, agent_id: &str) -> FleetResult<Vec<InboxEnvelope>>;

    /// Move an envelope to the processed set.
    fn mark_processed(&self, agent_id: &str, id: MessageId) -> FleetResult<()>;

    /// Look up one envelope regardless of processed state.
    fn find(&self, agent_id: &str, id: MessageId) -> FleetResult<Option<InboxEnvelope>>;
}

fn sort_envelopes(envelopes: &mut [InboxEnvelope]) {
    envelopes.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));
}

// ============================================================================
// DIRECTORY MAILBOX
// ============================================================================

/// One directory per agent, one `<message_id>.json` file per envelope, and a
/// `processed/` subdirectory.
#[derive(Debug, Clone)]
pub struct DirInboxStore {
    root: PathBuf,
    overrides: HashMap<AgentId, PathBuf>,
}

impl DirInboxStore {
    /// Mailboxes default to `<root>/<agent_id>`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overrides: HashMap::new(),
        }
    }

    /// Use an explicit directory for one agent.
    pub fn with_inbox(mut self, agent_id: &str, dir: impl Into<PathBuf>) -> Self {
        self.overrides.insert(agent_id.to_string(), dir.into());
        self
    }

    pub fn inbox_dir(&self, agent_id: &str) -> PathBuf {
        self.overrides
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| self.root.join(agent_id))
    }

    fn envelope_name(id: MessageId) -> String {
        format!("{id}.{ENVELOPE_EXT}")
    }

    fn read_envelope(path: &Path) -> FleetResult<Option<InboxEnvelope>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::parse(path, e).into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e).into()),
        }
    }

    fn read_dir_envelopes(dir: &Path) -> FleetResult<Vec<InboxEnvelope>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e).into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENVELOPE_EXT) {
                continue;
            }
            match Self::read_envelope(&path) {
                Ok(Some(envelope)) => out.push(envelope),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable envelope");
                }
            }
        }
        Ok(out)
    }
}

impl InboxStore for DirInboxStore {
    fn append(&self, agent_id: &str, envelope: &InboxEnvelope) -> FleetResult<bool> {
        let dir = self.inbox_dir(agent_id);
        let name = Self::envelope_name(envelope.id);
        if dir.join(PROCESSED_DIR).join(&name).exists() {
            return Ok(false);
        }
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let bytes = serde_json::to_vec_pretty(envelope).map_err(|e| StoreError::parse(&dir, e))?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;

        let target = dir.join(&name);
        match tmp.persist_noclobber(&target) {
            Ok(_) => {
                tracing::debug!(agent_id, message_id = %envelope.id, "inbox envelope written");
                Ok(true)
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::io(&target, e.error).into()),
        }
    }

    fn list_pending(&self, agent_id: &str) -> FleetResult<Vec<InboxEnvelope>> {
        let mut envelopes = Self::read_dir_envelopes(&self.inbox_dir(agent_id))?;
        sort_envelopes(&mut envelopes);
        Ok(envelopes)
    }

    fn list_all(&self, agent_id: &str) -> FleetResult<Vec<InboxEnvelope>> {
        let dir = self.inbox_dir(agent_id);
        let mut envelopes = Self::read_dir_envelopes(&dir)?;
        envelopes.extend(Self::read_dir_envelopes(&dir.join(PROCESSED_DIR))?);
        sort_envelopes(&mut envelopes);
        Ok(envelopes)
    }

    fn mark_processed(&self, agent_id: &str, id: MessageId) -> FleetResult<()> {
        let dir = self.inbox_dir(agent_id);
        let name = Self::envelope_name(id);
        let from = dir.join(&name);
        if !from.exists() {
            return Err(StoreError::NotFound { id: id.to_string() }.into());
        }
        let processed = dir.join(PROCESSED_DIR);
        fs::create_dir_all(&processed).map_err(|e| StoreError::io(&processed, e))?;
        fs::rename(&from, processed.join(&name)).map_err(|e| StoreError::io(&from, e))?;
        Ok(())
    }

    fn find(&self, agent_id: &str, id: MessageId) -> FleetResult<Option<InboxEnvelope>> {
        let dir = self.inbox_dir(agent_id);
        let name = Self::envelope_name(id);
        if let Some(envelope) = Self::read_envelope(&dir.join(&name))? {
            return Ok(Some(envelope));
        }
        Self::read_envelope(&dir.join(PROCESSED_DIR).join(&name))
    }
}

// ============================================================================
// IN-MEMORY MAILBOX
// ============================================================================

#[derive(Debug, Clone)]
struct Slot {
    envelope: InboxEnvelope,
    processed: bool,
}

/// In-memory mailboxes for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInbox {
    boxes: Arc<RwLock<HashMap<AgentId, BTreeMap<MessageId, Slot>>>>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, agent_id: &str, include_processed: bool) -> FleetResult<Vec<InboxEnvelope>> {
        let boxes = self.boxes.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut out: Vec<InboxEnvelope> = boxes
            .get(agent_id)
            .map(|slots| {
                slots
                    .values()
                    .filter(|s| include_processed || !s.processed)
                    .map(|s| s.envelope.clone())
                    .collect()
            })
            .unwrap_or_default();
        sort_envelopes(&mut out);
        Ok(out)
    }
}

impl InboxStore for InMemoryInbox {
    fn append(&self, agent_id: &str, envelope: &InboxEnvelope) -> FleetResult<bool> {
        let mut boxes = self.boxes.write().map_err(|_| StoreError::LockPoisoned)?;
        let slots = boxes.entry(agent_id.to_string()).or_default();
        if slots.contains_key(&envelope.id) {
            return Ok(false);
        }
        slots.insert(
            envelope.id,
            Slot {
                envelope: envelope.clone(),
                processed: false,
            },
        );
        Ok(true)
    }

    fn list_pending(&self, agent_id: &str) -> FleetResult<Vec<InboxEnvelope>> {
        self.collect(agent_id, false)
    }

    fn list_all(&self, agent_id: &str) -> FleetResult<Vec<InboxEnvelope>> {
        self.collect(agent_id, true)
    }

    fn mark_processed(&self, agent_id: &str, id: MessageId) -> FleetResult<()> {
        let mut boxes = self.boxes.write().map_err(|_| StoreError::LockPoisoned)?;
        match boxes
            .get_mut(agent_id)
            .and_then(|slots| slots.get_mut(&id))
            .filter(|slot| !slot.processed)
        {
            Some(slot) => {
                slot.processed = true;
                Ok(())
            }
            None => Err(StoreError::NotFound { id: id.to_string() }.into()),
        }
    }

    fn find(&self, agent_id: &str, id: MessageId) -> FleetResult<Option<InboxEnvelope>> {
        let boxes = self.boxes.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(boxes
            .get(agent_id)
            .and_then(|slots| slots.get(&id))
            .map(|slot| slot.envelope.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use fleet_core::{new_message_id, FleetError};

    fn envelope(content: &str, offset_secs: i64) -> InboxEnvelope {
        InboxEnvelope::new(
            new_message_id(),
            "Captain",
            "Agent-3",
            content,
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    fn exercise_mailbox(store: &dyn InboxStore) {
        let later = envelope("second", 10);
        let earlier = envelope("first", 0);

        assert!(store.append("Agent-3", &later).unwrap());
        assert!(store.append("Agent-3", &earlier).unwrap());
        // Append-once
        assert!(!store.append("Agent-3", &earlier).unwrap());

        let pending = store.list_pending("Agent-3").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].content, "first");

        store.mark_processed("Agent-3", earlier.id).unwrap();
        assert_eq!(store.list_pending("Agent-3").unwrap().len(), 1);
        assert_eq!(store.list_all("Agent-3").unwrap().len(), 2);

        // Processed entries still count for idempotency and lookup
        assert!(!store.append("Agent-3", &earlier).unwrap());
        let found = store.find("Agent-3", earlier.id).unwrap().unwrap();
        assert!(found.matches(earlier.id, &fingerprint(b"first")));
        assert!(!found.matches(earlier.id, &fingerprint(b"tampered")));

        let err = store.mark_processed("Agent-3", earlier.id).unwrap_err();
        assert!(matches!(err, FleetError::Store(StoreError::NotFound { .. })));

        assert!(store.list_pending("Agent-9").unwrap().is_empty());
        assert!(store.find("Agent-9", earlier.id).unwrap().is_none());
    }

    #[test]
    fn test_in_memory_mailbox() {
        exercise_mailbox(&InMemoryInbox::new());
    }

    #[test]
    fn test_directory_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        exercise_mailbox(&DirInboxStore::new(dir.path()));
    }

    #[test]
    fn test_directory_override_and_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom-box");
        let store = DirInboxStore::new(dir.path().join("root")).with_inbox("Agent-1", &custom);

        let env = envelope("hello", 0);
        store.append("Agent-1", &env).unwrap();
        assert!(custom.join(format!("{}.json", env.id)).exists());

        fs::write(custom.join("notes.txt"), "ignore me").unwrap();
        fs::write(custom.join("broken.json"), "{not json").unwrap();
        let pending = store.list_pending("Agent-1").unwrap();
        assert_eq!(pending, vec![env]);
    }
}
