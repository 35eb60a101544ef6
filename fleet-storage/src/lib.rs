//! Fleet Storage - Documents and Mailboxes
//!
//! Every shared piece of fleet state is either a single JSON document
//! (contracts, status snapshots, the outbound queue, dead letters) or a
//! per-agent mailbox directory. Documents are written only through
//! compare-and-swap against the revision that was read.

pub mod document;
pub mod inbox;
pub mod queue;
pub mod status;

pub use document::{
    modify, DocumentStore, InMemoryDocumentStore, JsonFileStore, Revision, Versioned,
};
pub use inbox::{DirInboxStore, InMemoryInbox, InboxEnvelope, InboxStore};
pub use queue::{
    DeadLetter, DeadLetterDocument, DeliveryRecord, OutboundQueue, QueueDocument,
    DELIVERY_HISTORY_LIMIT,
};
pub use status::{StatusDocument, StatusStore};
