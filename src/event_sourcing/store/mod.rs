// ============================================================================
// Event Sourcing Store - Persistence Collaborators
// ============================================================================
//
// The core only sees these traits. Every transactional store method takes the
// backend's transaction handle, so one unit of work (events + snapshot +
// outbox, or ledger + projection) commits or rolls back as a whole.
//
// Two backends:
// - memory.rs   - transactional in-memory tables (tests, local runs)
// - postgres.rs - sqlx / Postgres
//
// ============================================================================

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::core::{DomainEvent, Snapshot};
use crate::error::EsResult;
use crate::outbox::{OutboxRecord, PendingOutboxRecord};

pub use memory::{InMemoryBackend, InMemoryTx};
pub use postgres::{PgBackend, PgTx};

/// Opens, commits and rolls back transactions. Dropping a transaction
/// without committing it must discard it.
#[async_trait]
pub trait TransactionManager: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> EsResult<Self::Tx>;
    async fn commit(&self, tx: Self::Tx) -> EsResult<()>;
    async fn rollback(&self, tx: Self::Tx) -> EsResult<()>;
}

#[async_trait]
pub trait EventStore<Tx: Send>: Send + Sync {
    /// Append `events` (sequence numbers `expected_head + 1 ..`). Fails with
    /// ConcurrentModification if the persisted head is not `expected_head`.
    async fn append(
        &self,
        tx: &mut Tx,
        aggregate_id: &str,
        expected_head: i64,
        events: &[DomainEvent],
    ) -> EsResult<()>;

    /// Events with `after < sequence_number <= up_to`, ascending.
    async fn load(
        &self,
        tx: &mut Tx,
        aggregate_id: &str,
        after: i64,
        up_to: Option<i64>,
    ) -> EsResult<Vec<DomainEvent>>;

    /// Highest persisted sequence number, 0 if none
    async fn head(&self, tx: &mut Tx, aggregate_id: &str) -> EsResult<i64>;
}

#[async_trait]
pub trait SnapshotStore<Tx: Send>: Send + Sync {
    async fn save(&self, tx: &mut Tx, snapshot: &Snapshot) -> EsResult<()>;

    /// Newest snapshot with `sequence_number <= max_sequence` (or newest overall)
    async fn load_latest(
        &self,
        tx: &mut Tx,
        origin: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        max_sequence: Option<i64>,
    ) -> EsResult<Option<Snapshot>>;
}

#[async_trait]
pub trait OutboxStore<Tx: Send>: Send + Sync {
    async fn append(&self, tx: &mut Tx, records: &[OutboxRecord]) -> EsResult<()>;
}

/// The publisher's view of the outbox. Runs outside command transactions.
#[async_trait]
pub trait OutboxDrain: Send + Sync {
    /// Unpublished, not dead-lettered records in insertion order. Records of
    /// an aggregate with a dead-lettered record are parked and never returned.
    async fn fetch_unpublished(&self, limit: usize) -> EsResult<Vec<PendingOutboxRecord>>;

    async fn mark_published(&self, event_id: Uuid) -> EsResult<()>;

    /// Count one failed publish round. Returns the new attempt count.
    async fn record_failure(&self, event_id: Uuid, error: &str) -> EsResult<u32>;

    async fn mark_dead_lettered(&self, event_id: Uuid) -> EsResult<()>;

    /// Delete records published before `published_before`. Returns how many.
    async fn sweep(&self, published_before: DateTime<Utc>) -> EsResult<u64>;
}

/// One row of the consumed-message ledger.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumedMessage {
    pub domain_event_id: Uuid,
    pub consumer_id: String,
    pub tenant_id: Option<String>,
}

impl ConsumedMessage {
    /// An empty tenant id counts as no tenant, so every backend keys it the same way.
    pub fn new(domain_event_id: Uuid, consumer_id: &str, tenant_id: Option<&str>) -> Self {
        Self {
            domain_event_id,
            consumer_id: consumer_id.to_string(),
            tenant_id: tenant_id.filter(|t| !t.is_empty()).map(str::to_string),
        }
    }
}

#[async_trait]
pub trait ConsumedMessageStore<Tx: Send>: Send + Sync {
    async fn exists(&self, tx: &mut Tx, message: &ConsumedMessage) -> EsResult<bool>;

    /// Insert the ledger row. Fails with LedgerConflict if it already exists,
    /// at the latest when the transaction commits.
    async fn insert(&self, tx: &mut Tx, message: &ConsumedMessage) -> EsResult<()>;
}

/// A record the publisher gave up on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub channel_id: String,
    pub event_type: String,
    pub payload: String,
    pub error_message: String,
    pub failure_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, letter: &DeadLetter) -> EsResult<()>;
    async fn list(&self, limit: usize) -> EsResult<Vec<DeadLetter>>;
    async fn count(&self) -> EsResult<u64>;
}

/// The transactional stores of one backend.
pub struct StoreSet<Tx: Send> {
    pub events: Arc<dyn EventStore<Tx>>,
    pub snapshots: Arc<dyn SnapshotStore<Tx>>,
    pub outbox: Arc<dyn OutboxStore<Tx>>,
    pub consumed: Arc<dyn ConsumedMessageStore<Tx>>,
}

impl<Tx: Send> Clone for StoreSet<Tx> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            snapshots: self.snapshots.clone(),
            outbox: self.outbox.clone(),
            consumed: self.consumed.clone(),
        }
    }
}
