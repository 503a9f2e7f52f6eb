// ============================================================================
// Transactional Outbox
// ============================================================================
//
// The aggregate manager writes one OutboxRecord per staged event in the same
// transaction as the event itself. The publisher drains unpublished records
// afterwards, in insertion order, and flags them once the broker accepted
// them. Published records are swept after a retention window.
//
// ============================================================================

mod publisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_sourcing::DomainEvent;
use crate::messaging::WireMessage;

pub use publisher::{DrainReport, OutboxPublisher, OutboxPublisherConfig};

/// A domain event tagged with its channel and already mapped to the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub channel_id: String,
    pub event: DomainEvent,
    pub message: WireMessage,
}

impl OutboxRecord {
    pub fn event_id(&self) -> Uuid {
        self.event.id
    }

    pub fn aggregate_id(&self) -> &str {
        &self.event.aggregate_id
    }
}

/// An outbox record that has not been published yet, as seen by the drain.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingOutboxRecord {
    /// Insertion order across the whole outbox
    pub position: i64,
    pub record: OutboxRecord,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
