// ============================================================================
// Idempotent Consumer
// ============================================================================
//
// Per inbound message, in one transaction:
// 1. unwrap it to a DomainEvent
// 2. ledger key = (event id, consumer id, tenant id)
// 3. key present -> discard, nothing is applied
// 4. otherwise claim the key and run the handler
// 5. commit
//
// Two deliveries racing past step 3 both try to claim the key. The loser
// sees LedgerConflict (at insert or at commit), rolls back, and reports a
// duplicate. Any other failure rolls back and is returned, so the transport
// redelivers the message later.
//
// ============================================================================

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{EsError, EsResult};
use crate::event_sourcing::store::{ConsumedMessage, ConsumedMessageStore, TransactionManager};
use crate::event_sourcing::DomainEvent;
use crate::messaging::{InboundMessageMapper, MessageHandler, WireMessage};
use crate::metrics::Metrics;

/// The business effect of consuming an event, applied inside the ledger's
/// transaction.
#[async_trait]
pub trait InboundEventHandler<Tx: Send>: Send + Sync {
    async fn apply(&self, tx: &mut Tx, event: &DomainEvent) -> EsResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Applied,
    /// Already consumed by this consumer for this tenant; nothing happened
    Duplicate,
}

pub struct IdempotentConsumer<T: TransactionManager> {
    consumer_id: String,
    transactions: Arc<T>,
    ledger: Arc<dyn ConsumedMessageStore<T::Tx>>,
    handler: Arc<dyn InboundEventHandler<T::Tx>>,
    mapper: Arc<dyn InboundMessageMapper>,
    metrics: Option<Arc<Metrics>>,
}

impl<T: TransactionManager> IdempotentConsumer<T> {
    pub fn new(
        consumer_id: &str,
        transactions: Arc<T>,
        ledger: Arc<dyn ConsumedMessageStore<T::Tx>>,
        handler: Arc<dyn InboundEventHandler<T::Tx>>,
        mapper: Arc<dyn InboundMessageMapper>,
    ) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            transactions,
            ledger,
            handler,
            mapper,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub async fn consume_message(&self, message: &WireMessage) -> EsResult<ConsumeOutcome> {
        let event = self.mapper.to_event(message)?;
        self.consume(&event).await
    }

    pub async fn consume(&self, event: &DomainEvent) -> EsResult<ConsumeOutcome> {
        let key = ConsumedMessage::new(event.id, &self.consumer_id, event.tenant_id.as_deref());

        let mut tx = self.transactions.begin().await?;
        let outcome = match self.apply_once(&mut tx, &key, event).await {
            Ok(ConsumeOutcome::Applied) => match self.transactions.commit(tx).await {
                Ok(()) => Ok(ConsumeOutcome::Applied),
                Err(EsError::LedgerConflict { .. }) => Ok(ConsumeOutcome::Duplicate),
                Err(e) => Err(e),
            },
            Ok(ConsumeOutcome::Duplicate) | Err(EsError::LedgerConflict { .. }) => {
                self.rollback(tx).await;
                Ok(ConsumeOutcome::Duplicate)
            }
            Err(e) => {
                self.rollback(tx).await;
                Err(e)
            }
        };

        match &outcome {
            Ok(ConsumeOutcome::Applied) => {
                tracing::debug!(
                    consumer_id = %self.consumer_id,
                    event_id = %event.id,
                    aggregate_id = %event.aggregate_id,
                    sequence_number = event.sequence_number,
                    "Applied inbound event"
                );
            }
            Ok(ConsumeOutcome::Duplicate) => {
                tracing::info!(
                    consumer_id = %self.consumer_id,
                    event_id = %event.id,
                    aggregate_id = %event.aggregate_id,
                    "Discarded duplicate delivery"
                );
            }
            Err(e) => {
                tracing::warn!(
                    consumer_id = %self.consumer_id,
                    event_id = %event.id,
                    error = %e,
                    "Failed to consume inbound event"
                );
            }
        }

        if let (Some(metrics), Ok(outcome)) = (&self.metrics, &outcome) {
            metrics.record_inbound(&self.consumer_id, *outcome == ConsumeOutcome::Duplicate);
        }
        outcome
    }

    async fn apply_once(
        &self,
        tx: &mut T::Tx,
        key: &ConsumedMessage,
        event: &DomainEvent,
    ) -> EsResult<ConsumeOutcome> {
        if self.ledger.exists(tx, key).await? {
            return Ok(ConsumeOutcome::Duplicate);
        }
        self.ledger.insert(tx, key).await?;
        self.handler.apply(tx, event).await?;
        Ok(ConsumeOutcome::Applied)
    }

    async fn rollback(&self, tx: T::Tx) {
        if let Err(e) = self.transactions.rollback(tx).await {
            tracing::warn!(consumer_id = %self.consumer_id, error = %e, "Rollback failed");
        }
    }
}

#[async_trait]
impl<T: TransactionManager> MessageHandler for IdempotentConsumer<T> {
    async fn handle(&self, message: WireMessage) -> EsResult<()> {
        self.consume_message(&message).await.map(|_| ())
    }
}
