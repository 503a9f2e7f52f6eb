use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    schema, ConsumedMessage, ConsumedMessageStore, DeadLetter, DeadLetterStore, EventStore,
    OutboxDrain, OutboxStore, SnapshotStore, StoreSet, TransactionManager,
};
use crate::error::{EsError, EsResult};
use crate::event_sourcing::core::{DomainEvent, Snapshot};
use crate::messaging::WireMessage;
use crate::outbox::{OutboxRecord, PendingOutboxRecord};

// ============================================================================
// Postgres Backend (sqlx)
// ============================================================================
//
// Uniqueness is enforced by the tables themselves:
// - domain_events     PRIMARY KEY (aggregate_id, sequence_number)
// - consumed_messages PRIMARY KEY (domain_event_id, consumer_id, tenant_id)
// A unique violation on the first is a ConcurrentModification, on the second
// a LedgerConflict.
//
// ============================================================================

pub type PgTx = Transaction<'static, Postgres>;

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str, max_connections: u32) -> EsResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::info!(max_connections = max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn stores(&self) -> StoreSet<PgTx> {
        StoreSet {
            events: Arc::new(self.clone()),
            snapshots: Arc::new(self.clone()),
            outbox: Arc::new(self.clone()),
            consumed: Arc::new(self.clone()),
        }
    }

    /// Create the tables if they do not exist yet.
    pub async fn bootstrap_schema(&self) -> EsResult<()> {
        for statement in schema::ALL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!(statements = schema::ALL.len(), "Postgres schema ready");
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn event_from_row(row: &PgRow) -> EsResult<DomainEvent> {
    let metadata: Json<HashMap<String, String>> = row.try_get("metadata")?;
    Ok(DomainEvent {
        origin: row.try_get("origin")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        version: row.try_get("version")?,
        id: row.try_get("id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        sequence_number: row.try_get("sequence_number")?,
        payload: row.try_get("payload")?,
        timestamp: row.try_get("timestamp")?,
        tenant_id: row.try_get("tenant_id")?,
        correlation_id: row.try_get("correlation_id")?,
        triggered_by_event_id: row.try_get("triggered_by_event_id")?,
        triggered_by_user_id: row.try_get("triggered_by_user_id")?,
        metadata: metadata.0,
    })
}

fn attempts_from(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

#[async_trait]
impl TransactionManager for PgBackend {
    type Tx = PgTx;

    async fn begin(&self) -> EsResult<PgTx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: PgTx) -> EsResult<()> {
        tx.commit().await.map_err(|e| {
            if is_unique_violation(&e) {
                EsError::Store(format!("unique violation at commit: {}", e))
            } else {
                e.into()
            }
        })
    }

    async fn rollback(&self, tx: PgTx) -> EsResult<()> {
        Ok(tx.rollback().await?)
    }
}

#[async_trait]
impl EventStore<PgTx> for PgBackend {
    async fn append(
        &self,
        tx: &mut PgTx,
        aggregate_id: &str,
        expected_head: i64,
        events: &[DomainEvent],
    ) -> EsResult<()> {
        let actual = self.head(tx, aggregate_id).await?;
        if actual != expected_head {
            return Err(EsError::ConcurrentModification {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_head,
                actual,
            });
        }

        for event in events {
            let result = sqlx::query(
                "INSERT INTO domain_events (
                    id, origin, aggregate_type, event_type, version, aggregate_id,
                    sequence_number, payload, timestamp, tenant_id, correlation_id,
                    triggered_by_event_id, triggered_by_user_id, metadata
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(event.id)
            .bind(&event.origin)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(event.version)
            .bind(&event.aggregate_id)
            .bind(event.sequence_number)
            .bind(&event.payload)
            .bind(event.timestamp)
            .bind(&event.tenant_id)
            .bind(&event.correlation_id)
            .bind(event.triggered_by_event_id)
            .bind(&event.triggered_by_user_id)
            .bind(Json(&event.metadata))
            .execute(&mut **tx)
            .await;

            match result {
                Ok(_) => {}
                // Another writer committed the same sequence number first
                Err(e) if is_unique_violation(&e) => {
                    return Err(EsError::ConcurrentModification {
                        aggregate_id: aggregate_id.to_string(),
                        expected: expected_head,
                        actual: event.sequence_number,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            expected_head = expected_head,
            event_count = events.len(),
            "Appended events to Postgres"
        );
        Ok(())
    }

    async fn load(
        &self,
        tx: &mut PgTx,
        aggregate_id: &str,
        after: i64,
        up_to: Option<i64>,
    ) -> EsResult<Vec<DomainEvent>> {
        let rows = sqlx::query(
            "SELECT id, origin, aggregate_type, event_type, version, aggregate_id,
                    sequence_number, payload, timestamp, tenant_id, correlation_id,
                    triggered_by_event_id, triggered_by_user_id, metadata
             FROM domain_events
             WHERE aggregate_id = $1
               AND sequence_number > $2
               AND ($3::BIGINT IS NULL OR sequence_number <= $3)
             ORDER BY sequence_number ASC",
        )
        .bind(aggregate_id)
        .bind(after)
        .bind(up_to)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn head(&self, tx: &mut PgTx, aggregate_id: &str) -> EsResult<i64> {
        let head: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM domain_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(head)
    }
}

#[async_trait]
impl SnapshotStore<PgTx> for PgBackend {
    async fn save(&self, tx: &mut PgTx, snapshot: &Snapshot) -> EsResult<()> {
        sqlx::query(
            "INSERT INTO snapshots (origin, aggregate_type, aggregate_id, sequence_number, data)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (aggregate_id, sequence_number) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&snapshot.origin)
        .bind(&snapshot.aggregate_type)
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.sequence_number)
        .bind(&snapshot.data)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_latest(
        &self,
        tx: &mut PgTx,
        origin: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        max_sequence: Option<i64>,
    ) -> EsResult<Option<Snapshot>> {
        let row = sqlx::query(
            "SELECT origin, aggregate_type, aggregate_id, sequence_number, data
             FROM snapshots
             WHERE origin = $1 AND aggregate_type = $2 AND aggregate_id = $3
               AND ($4::BIGINT IS NULL OR sequence_number <= $4)
             ORDER BY sequence_number DESC
             LIMIT 1",
        )
        .bind(origin)
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(max_sequence)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| {
            Ok(Snapshot {
                origin: row.try_get("origin")?,
                aggregate_type: row.try_get("aggregate_type")?,
                aggregate_id: row.try_get("aggregate_id")?,
                sequence_number: row.try_get("sequence_number")?,
                data: row.try_get("data")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl OutboxStore<PgTx> for PgBackend {
    async fn append(&self, tx: &mut PgTx, records: &[OutboxRecord]) -> EsResult<()> {
        for record in records {
            sqlx::query(
                "INSERT INTO outbox_messages (
                    event_id, channel_id, aggregate_id, sequence_number, event, message
                ) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(record.event_id())
            .bind(&record.channel_id)
            .bind(record.aggregate_id())
            .bind(record.event.sequence_number)
            .bind(Json(&record.event))
            .bind(Json(&record.message))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumedMessageStore<PgTx> for PgBackend {
    async fn exists(&self, tx: &mut PgTx, message: &ConsumedMessage) -> EsResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM consumed_messages
                WHERE domain_event_id = $1 AND consumer_id = $2 AND tenant_id = $3
             )",
        )
        .bind(message.domain_event_id)
        .bind(&message.consumer_id)
        .bind(message.tenant_id.as_deref().unwrap_or(""))
        .fetch_one(&mut **tx)
        .await?;
        Ok(found)
    }

    async fn insert(&self, tx: &mut PgTx, message: &ConsumedMessage) -> EsResult<()> {
        // Blocks on a concurrent uncommitted insert of the same key, then
        // inserts nothing once that one commits
        let inserted = sqlx::query(
            "INSERT INTO consumed_messages (domain_event_id, consumer_id, tenant_id)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(message.domain_event_id)
        .bind(&message.consumer_id)
        .bind(message.tenant_id.as_deref().unwrap_or(""))
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(EsError::LedgerConflict {
                event_id: message.domain_event_id,
                consumer_id: message.consumer_id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxDrain for PgBackend {
    async fn fetch_unpublished(&self, limit: usize) -> EsResult<Vec<PendingOutboxRecord>> {
        let rows = sqlx::query(
            "SELECT o.position, o.channel_id, o.event, o.message, o.attempts, o.last_error, o.created_at
             FROM outbox_messages o
             WHERE o.published_at IS NULL AND NOT o.dead_lettered
               AND NOT EXISTS (
                   SELECT 1 FROM outbox_messages d
                   WHERE d.dead_lettered AND d.aggregate_id = o.aggregate_id
               )
             ORDER BY o.position ASC
             LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event: Json<DomainEvent> = row.try_get("event")?;
                let message: Json<WireMessage> = row.try_get("message")?;
                Ok(PendingOutboxRecord {
                    position: row.try_get("position")?,
                    record: OutboxRecord {
                        channel_id: row.try_get("channel_id")?,
                        event: event.0,
                        message: message.0,
                    },
                    attempts: attempts_from(row.try_get("attempts")?),
                    last_error: row.try_get("last_error")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn mark_published(&self, event_id: Uuid) -> EsResult<()> {
        sqlx::query("UPDATE outbox_messages SET published_at = now() WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, event_id: Uuid, error: &str) -> EsResult<u32> {
        let attempts: i32 = sqlx::query_scalar(
            "UPDATE outbox_messages
             SET attempts = attempts + 1, last_error = $2
             WHERE event_id = $1
             RETURNING attempts",
        )
        .bind(event_id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts_from(attempts))
    }

    async fn mark_dead_lettered(&self, event_id: Uuid) -> EsResult<()> {
        sqlx::query("UPDATE outbox_messages SET dead_lettered = TRUE WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep(&self, published_before: DateTime<Utc>) -> EsResult<u64> {
        let deleted = sqlx::query(
            "DELETE FROM outbox_messages WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(published_before)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

#[async_trait]
impl DeadLetterStore for PgBackend {
    async fn insert(&self, letter: &DeadLetter) -> EsResult<()> {
        sqlx::query(
            "INSERT INTO dead_letter_queue (
                event_id, aggregate_id, channel_id, event_type, payload,
                error_message, failure_count, first_failed_at, last_failed_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (event_id) DO UPDATE SET
                error_message = EXCLUDED.error_message,
                failure_count = EXCLUDED.failure_count,
                last_failed_at = EXCLUDED.last_failed_at",
        )
        .bind(letter.event_id)
        .bind(&letter.aggregate_id)
        .bind(&letter.channel_id)
        .bind(&letter.event_type)
        .bind(&letter.payload)
        .bind(&letter.error_message)
        .bind(i32::try_from(letter.failure_count).unwrap_or(i32::MAX))
        .bind(letter.first_failed_at)
        .bind(letter.last_failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> EsResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT event_id, aggregate_id, channel_id, event_type, payload,
                    error_message, failure_count, first_failed_at, last_failed_at
             FROM dead_letter_queue
             ORDER BY created_at ASC
             LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DeadLetter {
                    event_id: row.try_get("event_id")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    channel_id: row.try_get("channel_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    error_message: row.try_get("error_message")?,
                    failure_count: attempts_from(row.try_get("failure_count")?),
                    first_failed_at: row.try_get("first_failed_at")?,
                    last_failed_at: row.try_get("last_failed_at")?,
                })
            })
            .collect()
    }

    async fn count(&self) -> EsResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
