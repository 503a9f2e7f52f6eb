use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use super::events::OrderEvent;
use super::value_objects::OrderItem;
use crate::consumer::InboundEventHandler;
use crate::error::{EsError, EsResult};
use crate::event_sourcing::{DomainEvent, InMemoryTx, PgTx, Registry};

// ============================================================================
// Order Summary Projection
// ============================================================================
//
// Read model fed by the idempotent consumer: one row per order with its
// current status and item count. Works with either backend. Events of other
// aggregates, or not registered in this service, are ignored.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSummary {
    pub order_id: String,
    pub tenant_id: Option<String>,
    pub customer_id: Uuid,
    pub status: String,
    pub item_count: i64,
    pub events_applied: i64,
}

#[derive(Debug, Clone, PartialEq)]
enum SummaryChange {
    Created { customer_id: Uuid, item_count: i64 },
    Items(i64),
    Status(&'static str),
}

fn item_count(items: &[OrderItem]) -> i64 {
    items.iter().map(|item| i64::from(item.quantity)).sum()
}

impl SummaryChange {
    fn from_event(event: &OrderEvent) -> Self {
        match event {
            OrderEvent::Created(e) => SummaryChange::Created {
                customer_id: e.customer_id,
                item_count: item_count(&e.items),
            },
            OrderEvent::ItemsUpdated(e) => SummaryChange::Items(item_count(&e.items)),
            OrderEvent::Confirmed(_) => SummaryChange::Status("Confirmed"),
            OrderEvent::Shipped(_) => SummaryChange::Status("Shipped"),
            OrderEvent::Delivered(_) => SummaryChange::Status("Delivered"),
            OrderEvent::Cancelled(_) => SummaryChange::Status("Cancelled"),
            OrderEvent::Archived(_) => SummaryChange::Status("Archived"),
        }
    }
}

type SummaryTable = Arc<Mutex<HashMap<String, OrderSummary>>>;

#[derive(Clone)]
pub struct OrderSummaryProjection {
    registry: Arc<Registry>,
    summaries: SummaryTable,
}

impl OrderSummaryProjection {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            summaries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// In-memory read model; the Postgres variant writes `order_summaries`
    pub fn summary(&self, order_id: &str) -> Option<OrderSummary> {
        self.summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
    }

    fn change_for(&self, event: &DomainEvent) -> EsResult<Option<SummaryChange>> {
        if !self.registry.is_event_registered(&event.key()) {
            tracing::debug!(event_type = %event.event_type, "Ignoring event unknown to the order projection");
            return Ok(None);
        }
        // Registered, but possibly belonging to another aggregate's event set
        match self.registry.decode::<OrderEvent>(event) {
            Ok(order_event) => Ok(Some(SummaryChange::from_event(&order_event))),
            Err(EsError::EventTypeMismatch { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn apply_change(table: &SummaryTable, event: &DomainEvent, change: SummaryChange) {
    let mut summaries = table.lock().unwrap_or_else(PoisonError::into_inner);
    match change {
        SummaryChange::Created {
            customer_id,
            item_count,
        } => {
            summaries
                .entry(event.aggregate_id.clone())
                .or_insert_with(|| OrderSummary {
                    order_id: event.aggregate_id.clone(),
                    tenant_id: event.tenant_id.clone(),
                    customer_id,
                    status: "Created".to_string(),
                    item_count,
                    events_applied: 1,
                });
        }
        change => match summaries.get_mut(&event.aggregate_id) {
            Some(summary) => {
                match change {
                    SummaryChange::Items(count) => summary.item_count = count,
                    SummaryChange::Status(status) => summary.status = status.to_string(),
                    SummaryChange::Created { .. } => {}
                }
                summary.events_applied += 1;
            }
            None => tracing::warn!(
                order_id = %event.aggregate_id,
                event_type = %event.event_type,
                "Order summary missing, change dropped"
            ),
        },
    }
}

#[async_trait]
impl InboundEventHandler<InMemoryTx> for OrderSummaryProjection {
    async fn apply(&self, tx: &mut InMemoryTx, event: &DomainEvent) -> EsResult<()> {
        let Some(change) = self.change_for(event)? else {
            return Ok(());
        };
        let table = self.summaries.clone();
        let event = event.clone();
        tx.after_commit(move || apply_change(&table, &event, change));
        Ok(())
    }
}

#[async_trait]
impl InboundEventHandler<PgTx> for OrderSummaryProjection {
    async fn apply(&self, tx: &mut PgTx, event: &DomainEvent) -> EsResult<()> {
        let Some(change) = self.change_for(event)? else {
            return Ok(());
        };

        match change {
            SummaryChange::Created {
                customer_id,
                item_count,
            } => {
                sqlx::query(
                    "INSERT INTO order_summaries
                        (order_id, tenant_id, customer_id, status, item_count, events_applied)
                     VALUES ($1, $2, $3, 'Created', $4, 1)
                     ON CONFLICT (order_id) DO NOTHING",
                )
                .bind(&event.aggregate_id)
                .bind(event.tenant_id.as_deref())
                .bind(customer_id.to_string())
                .bind(item_count)
                .execute(&mut **tx)
                .await?;
            }
            SummaryChange::Items(count) => {
                sqlx::query(
                    "UPDATE order_summaries
                     SET item_count = $2, events_applied = events_applied + 1, updated_at = now()
                     WHERE order_id = $1",
                )
                .bind(&event.aggregate_id)
                .bind(count)
                .execute(&mut **tx)
                .await?;
            }
            SummaryChange::Status(status) => {
                sqlx::query(
                    "UPDATE order_summaries
                     SET status = $2, events_applied = events_applied + 1, updated_at = now()
                     WHERE order_id = $1",
                )
                .bind(&event.aggregate_id)
                .bind(status)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}
