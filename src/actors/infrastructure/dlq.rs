use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::Actor;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EsResult;
use crate::event_sourcing::store::{DeadLetter, DeadLetterStore};
use crate::metrics::Metrics;

// ============================================================================
// Dead Letter Queue Actor
// ============================================================================
//
// Receives outbox records the publisher gave up on.
// - persists them through a DeadLetterStore
// - answers queries for manual intervention
// - counts them by event type
//
// ============================================================================

pub struct DlqActor {
    store: Arc<dyn DeadLetterStore>,
    metrics: Option<Arc<Metrics>>,
}

impl DlqActor {
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Actor for DlqActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!("DlqActor started - Dead Letter Queue ready");
        Ok(state)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone)]
pub struct AddToDlq(pub DeadLetter);

#[derive(Debug, Clone, Copy)]
pub struct GetDlqMessages {
    pub limit: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct GetDlqStats;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DlqStats {
    pub total_messages: u64,
    pub by_event_type: HashMap<String, u64>,
}

// ============================================================================
// Handlers
// ============================================================================

impl Message<AddToDlq> for DlqActor {
    type Reply = EsResult<()>;

    async fn handle(&mut self, msg: AddToDlq, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let letter = msg.0;
        self.store.insert(&letter).await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_dlq_message(&letter.event_type);
        }

        tracing::info!(
            event_id = %letter.event_id,
            event_type = %letter.event_type,
            failure_count = letter.failure_count,
            "Message stored in DLQ"
        );
        Ok(())
    }
}

impl Message<GetDlqMessages> for DlqActor {
    type Reply = EsResult<Vec<DeadLetter>>;

    async fn handle(
        &mut self,
        msg: GetDlqMessages,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.store.list(msg.limit).await
    }
}

impl Message<GetDlqStats> for DlqActor {
    type Reply = EsResult<DlqStats>;

    async fn handle(&mut self, _msg: GetDlqStats, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let total_messages = self.store.count().await?;

        let mut by_event_type = HashMap::new();
        for letter in self.store.list(total_messages as usize).await? {
            *by_event_type.entry(letter.event_type).or_insert(0) += 1;
        }

        Ok(DlqStats {
            total_messages,
            by_event_type,
        })
    }
}
