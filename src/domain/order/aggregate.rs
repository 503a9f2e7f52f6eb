use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::commands::OrderCommand;
use super::errors::OrderError;
use super::events::*;
use super::value_objects::{OrderItem, OrderStatus};
use crate::event_sourcing::{Aggregate, DomainEvent};

// ============================================================================
// Order Aggregate - Domain Logic
// ============================================================================
//
// Identity and sequence number live on the AggregateRoot; this struct holds
// only what the events say about the order. Timestamps come from the event
// envelope so a replay always yields the same state.
//
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderAggregate {
    pub customer_id: Option<Uuid>,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub archived: bool,

    // Audit Trail
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub cancelled_reason: Option<String>,
}

impl OrderAggregate {
    pub fn is_initialized(&self) -> bool {
        self.customer_id.is_some()
    }

    pub fn item_count(&self) -> i64 {
        self.items.iter().map(|item| i64::from(item.quantity)).sum()
    }

    fn validate_items(items: &[OrderItem]) -> Result<(), OrderError> {
        if items.is_empty() {
            return Err(OrderError::EmptyItems);
        }
        for item in items {
            if item.quantity <= 0 {
                return Err(OrderError::InvalidQuantity(item.quantity));
            }
        }
        Ok(())
    }

    /// Decide which events a command produces. Does not change state.
    pub fn handle_command(&self, command: &OrderCommand) -> Result<Vec<OrderEvent>, OrderError> {
        if let OrderCommand::CreateOrder {
            customer_id, items, ..
        } = command
        {
            if self.is_initialized() {
                return Err(OrderError::AlreadyCreated);
            }
            Self::validate_items(items)?;
            return Ok(vec![OrderEvent::Created(OrderCreated {
                customer_id: *customer_id,
                items: items.clone(),
            })]);
        }

        if !self.is_initialized() {
            return Err(OrderError::NotInitialized);
        }
        if self.archived {
            return Err(OrderError::Archived);
        }

        match command {
            OrderCommand::CreateOrder { .. } => Err(OrderError::AlreadyCreated),

            OrderCommand::UpdateItems { items, reason } => {
                match self.status {
                    OrderStatus::Created => {}
                    OrderStatus::Cancelled => return Err(OrderError::AlreadyCancelled),
                    status => return Err(OrderError::InvalidStatusTransition(status)),
                }
                Self::validate_items(items)?;

                Ok(vec![OrderEvent::ItemsUpdated(OrderItemsUpdated {
                    items: items.clone(),
                    reason: reason.clone(),
                })])
            }

            OrderCommand::ConfirmOrder => {
                match self.status {
                    OrderStatus::Created => {}
                    OrderStatus::Confirmed => return Err(OrderError::AlreadyConfirmed),
                    status => return Err(OrderError::InvalidStatusTransition(status)),
                }

                Ok(vec![OrderEvent::Confirmed(OrderConfirmed {
                    confirmed_at: Utc::now(),
                })])
            }

            OrderCommand::ShipOrder {
                tracking_number,
                carrier,
            } => {
                match self.status {
                    OrderStatus::Confirmed => {}
                    OrderStatus::Created => return Err(OrderError::NotConfirmed),
                    status => return Err(OrderError::InvalidStatusTransition(status)),
                }

                Ok(vec![OrderEvent::Shipped(OrderShipped {
                    tracking_number: tracking_number.clone(),
                    carrier: carrier.clone(),
                    shipped_at: Utc::now(),
                })])
            }

            OrderCommand::DeliverOrder { signature } => {
                if self.status != OrderStatus::Shipped {
                    return Err(OrderError::NotShipped);
                }

                Ok(vec![OrderEvent::Delivered(OrderDelivered {
                    delivered_at: Utc::now(),
                    signature: signature.clone(),
                })])
            }

            OrderCommand::CancelOrder {
                reason,
                cancelled_by,
            } => {
                match self.status {
                    OrderStatus::Cancelled => return Err(OrderError::AlreadyCancelled),
                    OrderStatus::Delivered => {
                        return Err(OrderError::InvalidStatusTransition(self.status))
                    }
                    // Created, Confirmed or Shipped
                    _ => {}
                }

                Ok(vec![OrderEvent::Cancelled(OrderCancelled {
                    reason: reason.clone(),
                    cancelled_by: *cancelled_by,
                })])
            }

            OrderCommand::ArchiveOrder => {
                if !self.status.is_final() {
                    return Err(OrderError::InvalidStatusTransition(self.status));
                }
                Ok(vec![OrderEvent::Archived(OrderArchived {})])
            }
        }
    }
}

impl Aggregate for OrderAggregate {
    type Event = OrderEvent;

    fn apply(&mut self, event: &OrderEvent, envelope: &DomainEvent) {
        self.updated_at = Some(envelope.timestamp);

        match event {
            OrderEvent::Created(e) => {
                self.customer_id = Some(e.customer_id);
                self.items = e.items.clone();
                self.status = OrderStatus::Created;
                self.created_at = Some(envelope.timestamp);
            }
            OrderEvent::ItemsUpdated(e) => {
                self.items = e.items.clone();
            }
            OrderEvent::Confirmed(_) => {
                self.status = OrderStatus::Confirmed;
            }
            OrderEvent::Shipped(e) => {
                self.status = OrderStatus::Shipped;
                self.tracking_number = Some(e.tracking_number.clone());
                self.carrier = Some(e.carrier.clone());
            }
            OrderEvent::Delivered(_) => {
                self.status = OrderStatus::Delivered;
            }
            OrderEvent::Cancelled(e) => {
                self.status = OrderStatus::Cancelled;
                self.cancelled_reason = e.reason.clone();
            }
            OrderEvent::Archived(_) => {
                self.archived = true;
            }
        }
    }

    fn is_creation(event: &OrderEvent) -> bool {
        matches!(event, OrderEvent::Created(_))
    }

    fn is_deletion(event: &OrderEvent) -> bool {
        matches!(event, OrderEvent::Archived(_))
    }
}
