use std::sync::Arc;

use super::core::{Aggregate, AggregateRoot, Registry};
use super::store::{EventStore, SnapshotStore, StoreSet};
use crate::error::{EsError, EsResult};

// ============================================================================
// Aggregate Factory - rehydration
// ============================================================================
//
// build(id, to):
// 1. newest snapshot at or below `to` (only if the aggregate has a policy)
// 2. events strictly after the snapshot, up to `to`, ascending
// 3. apply them one by one; any gap is corruption and aborts the build
//
// Snapshots are an optimization only. A snapshot that no longer
// deserializes is skipped and the aggregate is replayed from the start.
//
// ============================================================================

pub struct AggregateFactory<Tx: Send> {
    registry: Arc<Registry>,
    events: Arc<dyn EventStore<Tx>>,
    snapshots: Arc<dyn SnapshotStore<Tx>>,
}

impl<Tx: Send> Clone for AggregateFactory<Tx> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            events: self.events.clone(),
            snapshots: self.snapshots.clone(),
        }
    }
}

impl<Tx: Send> AggregateFactory<Tx> {
    pub fn new(registry: Arc<Registry>, stores: &StoreSet<Tx>) -> Self {
        Self {
            registry,
            events: stores.events.clone(),
            snapshots: stores.snapshots.clone(),
        }
    }

    /// Rehydrate `aggregate_id`, optionally only up to `to_sequence_number`.
    /// `Ok(None)` when neither a snapshot nor any event exists.
    pub async fn build<A: Aggregate>(
        &self,
        tx: &mut Tx,
        aggregate_id: &str,
        to_sequence_number: Option<i64>,
    ) -> EsResult<Option<AggregateRoot<A>>> {
        let metadata = self.registry.lookup::<A>()?;

        let snapshot = match metadata.snapshot_policy {
            Some(_) => {
                self.snapshots
                    .load_latest(
                        tx,
                        &metadata.origin,
                        &metadata.aggregate_type,
                        aggregate_id,
                        to_sequence_number,
                    )
                    .await?
            }
            None => None,
        };

        let restored = match &snapshot {
            Some(snapshot) => match AggregateRoot::<A>::restore(self.registry.clone(), snapshot) {
                Ok(root) => Some(root),
                Err(EsError::Serialization(e)) => {
                    tracing::warn!(
                        aggregate_id = %aggregate_id,
                        sequence_number = snapshot.sequence_number,
                        error = %e,
                        "Snapshot no longer deserializes, replaying from the first event"
                    );
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let after = restored
            .as_ref()
            .map(|root| root.current_sequence_number())
            .unwrap_or(0);
        let events = self
            .events
            .load(tx, aggregate_id, after, to_sequence_number)
            .await?;

        if restored.is_none() && events.is_empty() {
            return Ok(None);
        }

        let mut root = match restored {
            Some(root) => root,
            None => AggregateRoot::new(self.registry.clone())?,
        };

        for event in &events {
            if let Err(e) = root.apply_event(event) {
                if e.is_corruption() {
                    tracing::error!(
                        aggregate_id = %aggregate_id,
                        sequence_number = event.sequence_number,
                        event_id = %event.id,
                        error = %e,
                        "Event log corrupted, refusing to rehydrate aggregate"
                    );
                }
                return Err(e);
            }
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            from_snapshot = after,
            replayed = events.len(),
            sequence_number = root.current_sequence_number(),
            "Rehydrated aggregate"
        );

        Ok(Some(root))
    }
}
