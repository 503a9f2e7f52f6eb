use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ConsumedMessage, ConsumedMessageStore, DeadLetter, DeadLetterStore, EventStore, OutboxDrain,
    OutboxStore, SnapshotStore, StoreSet, TransactionManager,
};
use crate::error::{EsError, EsResult};
use crate::event_sourcing::core::{DomainEvent, Snapshot};
use crate::outbox::{OutboxRecord, PendingOutboxRecord};

// ============================================================================
// Transactional In-Memory Backend
// ============================================================================
//
// Committed state lives in `Tables` behind one lock. A transaction buffers
// its writes; reads see committed state plus the transaction's own writes.
// Commit re-checks every uniqueness rule against the committed state and
// applies all buffered writes at once, or none of them. Dropping a
// transaction discards it.
//
// ============================================================================

struct OutboxRow {
    record: OutboxRecord,
    attempts: u32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    dead_lettered: bool,
}

#[derive(Default)]
struct Tables {
    events: HashMap<String, Vec<DomainEvent>>,
    snapshots: HashMap<String, BTreeMap<i64, Snapshot>>,
    outbox: BTreeMap<i64, OutboxRow>,
    outbox_positions: HashMap<Uuid, i64>,
    next_position: i64,
    consumed: HashSet<ConsumedMessage>,
    dead_letters: Vec<DeadLetter>,
}

impl Tables {
    fn head(&self, aggregate_id: &str) -> i64 {
        self.events
            .get(aggregate_id)
            .and_then(|events| events.last())
            .map(|event| event.sequence_number)
            .unwrap_or(0)
    }
}

struct PendingAppend {
    base_head: i64,
    events: Vec<DomainEvent>,
}

type CommitHook = Box<dyn FnOnce() + Send>;

/// Buffered writes of one in-memory transaction.
#[derive(Default)]
pub struct InMemoryTx {
    appends: HashMap<String, PendingAppend>,
    snapshots: Vec<Snapshot>,
    outbox: Vec<OutboxRecord>,
    consumed: Vec<ConsumedMessage>,
    after_commit: Vec<CommitHook>,
}

impl InMemoryTx {
    /// Run `hook` once this transaction has committed. Never runs on rollback.
    pub fn after_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.after_commit.push(Box::new(hook));
    }

    fn pending_head(&self, aggregate_id: &str) -> Option<i64> {
        self.appends.get(aggregate_id).map(|pending| {
            pending
                .events
                .last()
                .map(|event| event.sequence_number)
                .unwrap_or(pending.base_head)
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    tables: Arc<Mutex<Tables>>,
    fail_next_commits: Arc<AtomicU32>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores(&self) -> StoreSet<InMemoryTx> {
        StoreSet {
            events: Arc::new(self.clone()),
            snapshots: Arc::new(self.clone()),
            outbox: Arc::new(self.clone()),
            consumed: Arc::new(self.clone()),
        }
    }

    /// Make the next `n` commits fail with a store error (nothing is applied).
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_next_commits.store(n, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Inspection helpers
    // ------------------------------------------------------------------------

    pub async fn committed_events(&self, aggregate_id: &str) -> Vec<DomainEvent> {
        self.tables
            .lock()
            .await
            .events
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot_sequence_numbers(&self, aggregate_id: &str) -> Vec<i64> {
        self.tables
            .lock()
            .await
            .snapshots
            .get(aggregate_id)
            .map(|snapshots| snapshots.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn delete_all_snapshots(&self) {
        self.tables.lock().await.snapshots.clear();
    }

    /// Outbox records with their published flag, in insertion order
    pub async fn outbox_records(&self) -> Vec<(OutboxRecord, bool)> {
        self.tables
            .lock()
            .await
            .outbox
            .values()
            .map(|row| (row.record.clone(), row.published_at.is_some()))
            .collect()
    }

    pub async fn consumed_count(&self) -> usize {
        self.tables.lock().await.consumed.len()
    }

    /// Write events straight into the log, bypassing every check.
    /// Only for reproducing corrupted histories.
    pub async fn insert_raw_events(&self, events: Vec<DomainEvent>) {
        let mut tables = self.tables.lock().await;
        for event in events {
            tables
                .events
                .entry(event.aggregate_id.clone())
                .or_default()
                .push(event);
        }
    }

    fn commit_into(tables: &mut Tables, tx: &mut InMemoryTx) -> EsResult<()> {
        // Validate everything first, then apply
        for (aggregate_id, pending) in &tx.appends {
            let actual = tables.head(aggregate_id);
            if actual != pending.base_head {
                return Err(EsError::ConcurrentModification {
                    aggregate_id: aggregate_id.clone(),
                    expected: pending.base_head,
                    actual,
                });
            }
        }
        let mut seen = HashSet::new();
        for message in &tx.consumed {
            if tables.consumed.contains(message) || !seen.insert(message) {
                return Err(EsError::LedgerConflict {
                    event_id: message.domain_event_id,
                    consumer_id: message.consumer_id.clone(),
                });
            }
        }
        for record in &tx.outbox {
            if tables.outbox_positions.contains_key(&record.event_id()) {
                return Err(EsError::Store(format!(
                    "outbox already holds event {}",
                    record.event_id()
                )));
            }
        }

        for (aggregate_id, pending) in tx.appends.drain() {
            tables
                .events
                .entry(aggregate_id)
                .or_default()
                .extend(pending.events);
        }
        for snapshot in tx.snapshots.drain(..) {
            tables
                .snapshots
                .entry(snapshot.aggregate_id.clone())
                .or_default()
                .insert(snapshot.sequence_number, snapshot);
        }
        let now = Utc::now();
        for record in tx.outbox.drain(..) {
            tables.next_position += 1;
            let position = tables.next_position;
            tables.outbox_positions.insert(record.event_id(), position);
            tables.outbox.insert(
                position,
                OutboxRow {
                    record,
                    attempts: 0,
                    last_error: None,
                    created_at: now,
                    published_at: None,
                    dead_lettered: false,
                },
            );
        }
        tables.consumed.extend(tx.consumed.drain(..));
        Ok(())
    }

    async fn with_outbox_row<T>(
        &self,
        event_id: Uuid,
        f: impl FnOnce(&mut OutboxRow) -> T,
    ) -> EsResult<T> {
        let mut tables = self.tables.lock().await;
        let position = *tables
            .outbox_positions
            .get(&event_id)
            .ok_or_else(|| EsError::Store(format!("no outbox record for event {}", event_id)))?;
        let row = tables
            .outbox
            .get_mut(&position)
            .ok_or_else(|| EsError::Store(format!("outbox record {} was swept", event_id)))?;
        Ok(f(row))
    }
}

#[async_trait]
impl TransactionManager for InMemoryBackend {
    type Tx = InMemoryTx;

    async fn begin(&self) -> EsResult<InMemoryTx> {
        Ok(InMemoryTx::default())
    }

    async fn commit(&self, mut tx: InMemoryTx) -> EsResult<()> {
        let injected = self
            .fail_next_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            tracing::warn!("Injected commit failure, transaction discarded");
            return Err(EsError::Store("injected commit failure".to_string()));
        }

        {
            let mut tables = self.tables.lock().await;
            Self::commit_into(&mut tables, &mut tx)?;
        }

        for hook in tx.after_commit.drain(..) {
            hook();
        }
        Ok(())
    }

    async fn rollback(&self, tx: InMemoryTx) -> EsResult<()> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl EventStore<InMemoryTx> for InMemoryBackend {
    async fn append(
        &self,
        tx: &mut InMemoryTx,
        aggregate_id: &str,
        expected_head: i64,
        events: &[DomainEvent],
    ) -> EsResult<()> {
        let committed_head = self.tables.lock().await.head(aggregate_id);
        let actual = tx.pending_head(aggregate_id).unwrap_or(committed_head);
        if actual != expected_head {
            return Err(EsError::ConcurrentModification {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_head,
                actual,
            });
        }

        tx.appends
            .entry(aggregate_id.to_string())
            .or_insert_with(|| PendingAppend {
                base_head: committed_head,
                events: Vec::new(),
            })
            .events
            .extend_from_slice(events);
        Ok(())
    }

    async fn load(
        &self,
        tx: &mut InMemoryTx,
        aggregate_id: &str,
        after: i64,
        up_to: Option<i64>,
    ) -> EsResult<Vec<DomainEvent>> {
        let tables = self.tables.lock().await;
        let committed = tables.events.get(aggregate_id).into_iter().flatten();
        let own = tx
            .appends
            .get(aggregate_id)
            .map(|pending| pending.events.iter())
            .into_iter()
            .flatten();

        let mut events: Vec<DomainEvent> = committed
            .chain(own)
            .filter(|event| event.sequence_number > after)
            .filter(|event| up_to.map_or(true, |max| event.sequence_number <= max))
            .cloned()
            .collect();
        events.sort_by_key(|event| event.sequence_number);
        Ok(events)
    }

    async fn head(&self, tx: &mut InMemoryTx, aggregate_id: &str) -> EsResult<i64> {
        let committed = self.tables.lock().await.head(aggregate_id);
        Ok(tx.pending_head(aggregate_id).unwrap_or(committed))
    }
}

#[async_trait]
impl SnapshotStore<InMemoryTx> for InMemoryBackend {
    async fn save(&self, tx: &mut InMemoryTx, snapshot: &Snapshot) -> EsResult<()> {
        tx.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn load_latest(
        &self,
        tx: &mut InMemoryTx,
        origin: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        max_sequence: Option<i64>,
    ) -> EsResult<Option<Snapshot>> {
        let tables = self.tables.lock().await;
        let committed = tables.snapshots.get(aggregate_id).into_iter().flat_map(|s| s.values());
        let own = tx.snapshots.iter().filter(|s| s.aggregate_id == aggregate_id);

        Ok(committed
            .chain(own)
            .filter(|s| s.origin == origin && s.aggregate_type == aggregate_type)
            .filter(|s| max_sequence.map_or(true, |max| s.sequence_number <= max))
            .max_by_key(|s| s.sequence_number)
            .cloned())
    }
}

#[async_trait]
impl OutboxStore<InMemoryTx> for InMemoryBackend {
    async fn append(&self, tx: &mut InMemoryTx, records: &[OutboxRecord]) -> EsResult<()> {
        tx.outbox.extend_from_slice(records);
        Ok(())
    }
}

#[async_trait]
impl ConsumedMessageStore<InMemoryTx> for InMemoryBackend {
    async fn exists(&self, tx: &mut InMemoryTx, message: &ConsumedMessage) -> EsResult<bool> {
        Ok(tx.consumed.contains(message) || self.tables.lock().await.consumed.contains(message))
    }

    async fn insert(&self, tx: &mut InMemoryTx, message: &ConsumedMessage) -> EsResult<()> {
        if self.exists(tx, message).await? {
            return Err(EsError::LedgerConflict {
                event_id: message.domain_event_id,
                consumer_id: message.consumer_id.clone(),
            });
        }
        tx.consumed.push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxDrain for InMemoryBackend {
    async fn fetch_unpublished(&self, limit: usize) -> EsResult<Vec<PendingOutboxRecord>> {
        let tables = self.tables.lock().await;
        let parked: HashSet<&str> = tables
            .outbox
            .values()
            .filter(|row| row.dead_lettered)
            .map(|row| row.record.aggregate_id())
            .collect();
        Ok(tables
            .outbox
            .iter()
            .filter(|(_, row)| row.published_at.is_none() && !row.dead_lettered)
            .filter(|(_, row)| !parked.contains(row.record.aggregate_id()))
            .take(limit)
            .map(|(position, row)| PendingOutboxRecord {
                position: *position,
                record: row.record.clone(),
                attempts: row.attempts,
                last_error: row.last_error.clone(),
                created_at: row.created_at,
            })
            .collect())
    }

    async fn mark_published(&self, event_id: Uuid) -> EsResult<()> {
        self.with_outbox_row(event_id, |row| row.published_at = Some(Utc::now()))
            .await
    }

    async fn record_failure(&self, event_id: Uuid, error: &str) -> EsResult<u32> {
        self.with_outbox_row(event_id, |row| {
            row.attempts += 1;
            row.last_error = Some(error.to_string());
            row.attempts
        })
        .await
    }

    async fn mark_dead_lettered(&self, event_id: Uuid) -> EsResult<()> {
        self.with_outbox_row(event_id, |row| row.dead_lettered = true)
            .await
    }

    async fn sweep(&self, published_before: DateTime<Utc>) -> EsResult<u64> {
        let mut tables = self.tables.lock().await;
        let expired: Vec<(i64, Uuid)> = tables
            .outbox
            .iter()
            .filter(|(_, row)| row.published_at.is_some_and(|at| at < published_before))
            .map(|(position, row)| (*position, row.record.event_id()))
            .collect();
        for (position, event_id) in &expired {
            tables.outbox.remove(position);
            tables.outbox_positions.remove(event_id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryBackend {
    async fn insert(&self, letter: &DeadLetter) -> EsResult<()> {
        self.tables.lock().await.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> EsResult<Vec<DeadLetter>> {
        Ok(self
            .tables
            .lock()
            .await
            .dead_letters
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self) -> EsResult<u64> {
        Ok(self.tables.lock().await.dead_letters.len() as u64)
    }
}
