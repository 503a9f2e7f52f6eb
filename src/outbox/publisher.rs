use chrono::Utc;
use kameo::actor::ActorRef;
use kameo::error::SendError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::PendingOutboxRecord;
use crate::actors::{AddToDlq, DlqActor};
use crate::error::{EsError, EsResult};
use crate::event_sourcing::store::{DeadLetter, OutboxDrain};
use crate::messaging::MessageProducer;
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// Outbox Publisher
// ============================================================================
//
// One drain round:
// 1. fetch up to `batch_size` unpublished records, oldest first
// 2. publish each with retry; success flags it published
// 3. a failed round bumps the record's attempt count; at `max_attempts` the
//    record goes to the DLQ and is flagged dead-lettered
// 4. once a record of an aggregate failed, later records of the same
//    aggregate are left for the next round (per-aggregate order)
// 5. a dead-lettered record parks its aggregate: the drain returns none of
//    its later records until the dead-lettered row is dealt with
//
// A crash between publish and flagging republishes the record on the next
// round. Consumers deduplicate through the consumed-message ledger.
//
// Exactly one publisher should drain a given outbox.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Failed rounds before a record is dead-lettered
    pub max_attempts: u32,
    /// How long published records are kept before sweeping
    pub retention: Duration,
    /// Retries within one round
    pub retry: RetryConfig,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            max_attempts: 5,
            retention: Duration::from_secs(3600),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Left for the next round behind an earlier failure of the same aggregate
    pub skipped: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.published + self.failed + self.dead_lettered + self.skipped == 0
    }
}

pub struct OutboxPublisher {
    drain: Arc<dyn OutboxDrain>,
    producer: Arc<dyn MessageProducer>,
    dlq: Option<ActorRef<DlqActor>>,
    metrics: Option<Arc<Metrics>>,
    config: OutboxPublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        drain: Arc<dyn OutboxDrain>,
        producer: Arc<dyn MessageProducer>,
        config: OutboxPublisherConfig,
    ) -> Self {
        Self {
            drain,
            producer,
            dlq: None,
            metrics: None,
            config,
        }
    }

    pub fn with_dlq(mut self, dlq: ActorRef<DlqActor>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &OutboxPublisherConfig {
        &self.config
    }

    pub async fn drain_once(&self) -> EsResult<DrainReport> {
        let batch = self.drain.fetch_unpublished(self.config.batch_size).await?;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for pending in batch {
            let aggregate_id = pending.record.aggregate_id().to_string();
            if blocked.contains(&aggregate_id) {
                report.skipped += 1;
                continue;
            }

            let event_id = pending.record.event_id();
            let channel_id = pending.record.channel_id.as_str();
            let started = Instant::now();

            let result = retry_on_transient(&self.config.retry, |attempt| {
                tracing::debug!(
                    event_id = %event_id,
                    channel_id = %channel_id,
                    attempt = attempt,
                    "Publishing outbox record"
                );
                self.producer.publish(channel_id, &pending.record.message)
            })
            .await
            .into_result();

            if let Some(metrics) = &self.metrics {
                metrics.record_publish(channel_id, started.elapsed().as_secs_f64(), result.is_ok());
            }

            match result {
                Ok(()) => {
                    self.drain.mark_published(event_id).await?;
                    tracing::info!(
                        event_id = %event_id,
                        aggregate_id = %aggregate_id,
                        sequence_number = pending.record.event.sequence_number,
                        channel_id = %channel_id,
                        "Published outbox record"
                    );
                    report.published += 1;
                }
                Err(e) => {
                    blocked.insert(aggregate_id);
                    let error_message = e.to_string();
                    let attempts = self.drain.record_failure(event_id, &error_message).await?;

                    if attempts >= self.config.max_attempts {
                        self.dead_letter(&pending, attempts, &error_message).await?;
                        self.drain.mark_dead_lettered(event_id).await?;
                        report.dead_lettered += 1;
                    } else {
                        tracing::warn!(
                            event_id = %event_id,
                            channel_id = %channel_id,
                            attempts = attempts,
                            max_attempts = self.config.max_attempts,
                            error = %error_message,
                            "Failed to publish outbox record, will retry next round"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        if !report.is_empty() {
            tracing::debug!(
                published = report.published,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                skipped = report.skipped,
                "Drained outbox"
            );
        }
        Ok(report)
    }

    /// Delete records published longer ago than the retention window.
    pub async fn sweep(&self) -> EsResult<u64> {
        let cutoff = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let swept = self.drain.sweep(cutoff).await?;
        if swept > 0 {
            tracing::info!(swept = swept, "Swept published outbox records");
            if let Some(metrics) = &self.metrics {
                metrics.record_swept(swept);
            }
        }
        Ok(swept)
    }

    async fn dead_letter(
        &self,
        pending: &PendingOutboxRecord,
        attempts: u32,
        error_message: &str,
    ) -> EsResult<()> {
        let record = &pending.record;
        tracing::error!(
            event_id = %record.event_id(),
            aggregate_id = %record.aggregate_id(),
            channel_id = %record.channel_id,
            event_type = %record.event.event_type,
            attempts = attempts,
            error = %error_message,
            "Giving up on outbox record, sending to DLQ and parking the aggregate"
        );

        let Some(dlq) = &self.dlq else {
            return Ok(());
        };

        let now = Utc::now();
        let letter = DeadLetter {
            event_id: record.event_id(),
            aggregate_id: record.aggregate_id().to_string(),
            channel_id: record.channel_id.clone(),
            event_type: record.event.event_type.clone(),
            payload: record.message.payload.clone(),
            error_message: error_message.to_string(),
            failure_count: attempts,
            // lower bound, the drain does not track the first failure
            first_failed_at: pending.created_at,
            last_failed_at: now,
        };

        match dlq.ask(AddToDlq(letter)).await {
            Ok(()) => Ok(()),
            Err(SendError::HandlerError(e)) => Err(e),
            Err(e) => Err(EsError::Messaging(format!("dead letter queue unavailable: {e}"))),
        }
    }
}
