//! Identity types for fleet entities

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Message identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, so queue order by id matches creation order.
pub type MessageId = Uuid;

/// Stable agent identifier (e.g. `"Agent-3"`).
pub type AgentId = String;

/// Globally unique contract identifier (e.g. `"C-100"`).
pub type ContractId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash for integrity verification.
pub type ContentHash = [u8; 32];

/// Generate a new UUIDv7 MessageId (timestamp-sortable).
pub fn new_message_id() -> MessageId {
    Uuid::now_v7()
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex-encoded SHA-256 fingerprint of a piece of text.
///
/// Used to match inbox artifacts against the content that was injected, and
/// as the revision marker for stored documents.
pub fn fingerprint(content: &[u8]) -> String {
    hex::encode(compute_content_hash(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_id_is_v7() {
        let id = new_message_id();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_message_ids_are_sortable() {
        let id1 = new_message_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = new_message_id();
        assert!(id1.to_string() < id2.to_string());
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = fingerprint(b"hello world");
        let b = fingerprint(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint(b"hello world!"));
    }
}
