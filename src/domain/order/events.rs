use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::value_objects::OrderItem;
use super::{ORDER_AGGREGATE_TYPE, ORDER_ORIGIN};
use crate::error::EsResult;
use crate::event_sourcing::{decode_as, EventDescriptor, EventKey, EventSet};

// ============================================================================
// Order Events - Domain Events for Order Aggregate
// ============================================================================
//
// Every payload is persisted under (orders-service, Order, <name>, 1).
// Changing a payload shape means registering a new version next to the old.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Created(OrderCreated),
    ItemsUpdated(OrderItemsUpdated),
    Confirmed(OrderConfirmed),
    Shipped(OrderShipped),
    Delivered(OrderDelivered),
    Cancelled(OrderCancelled),
    Archived(OrderArchived),
}

const VERSION: i32 = 1;

fn key(event_type: &str) -> EventKey {
    EventKey::new(ORDER_ORIGIN, ORDER_AGGREGATE_TYPE, event_type, VERSION)
}

impl EventSet for OrderEvent {
    fn descriptors() -> Vec<EventDescriptor<Self>> {
        vec![
            EventDescriptor::new(key("OrderCreated"), |v| decode_as(v, OrderEvent::Created)),
            EventDescriptor::new(key("OrderItemsUpdated"), |v| {
                decode_as(v, OrderEvent::ItemsUpdated)
            }),
            EventDescriptor::new(key("OrderConfirmed"), |v| decode_as(v, OrderEvent::Confirmed)),
            EventDescriptor::new(key("OrderShipped"), |v| decode_as(v, OrderEvent::Shipped)),
            EventDescriptor::new(key("OrderDelivered"), |v| decode_as(v, OrderEvent::Delivered)),
            EventDescriptor::new(key("OrderCancelled"), |v| decode_as(v, OrderEvent::Cancelled)),
            EventDescriptor::new(key("OrderArchived"), |v| decode_as(v, OrderEvent::Archived)),
        ]
    }

    fn key(&self) -> EventKey {
        let name = match self {
            OrderEvent::Created(_) => "OrderCreated",
            OrderEvent::ItemsUpdated(_) => "OrderItemsUpdated",
            OrderEvent::Confirmed(_) => "OrderConfirmed",
            OrderEvent::Shipped(_) => "OrderShipped",
            OrderEvent::Delivered(_) => "OrderDelivered",
            OrderEvent::Cancelled(_) => "OrderCancelled",
            OrderEvent::Archived(_) => "OrderArchived",
        };
        key(name)
    }

    fn to_payload(&self) -> EsResult<Value> {
        Ok(match self {
            OrderEvent::Created(e) => serde_json::to_value(e)?,
            OrderEvent::ItemsUpdated(e) => serde_json::to_value(e)?,
            OrderEvent::Confirmed(e) => serde_json::to_value(e)?,
            OrderEvent::Shipped(e) => serde_json::to_value(e)?,
            OrderEvent::Delivered(e) => serde_json::to_value(e)?,
            OrderEvent::Cancelled(e) => serde_json::to_value(e)?,
            OrderEvent::Archived(e) => serde_json::to_value(e)?,
        })
    }
}

// ============================================================================
// Individual Event Types
// ============================================================================

/// Order Created - Initial event in order lifecycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCreated {
    pub customer_id: Uuid,
    pub items: Vec<OrderItem>,
}

/// Order Items Updated - Order contents modified
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderItemsUpdated {
    pub items: Vec<OrderItem>,
    pub reason: Option<String>,
}

/// Order Confirmed - Order accepted for fulfillment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderConfirmed {
    pub confirmed_at: DateTime<Utc>,
}

/// Order Shipped - Order dispatched to customer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderShipped {
    pub tracking_number: String,
    pub carrier: String,
    pub shipped_at: DateTime<Utc>,
}

/// Order Delivered - Order successfully delivered
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderDelivered {
    pub delivered_at: DateTime<Utc>,
    pub signature: Option<String>,
}

/// Order Cancelled - Order lifecycle ended
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCancelled {
    pub reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
}

/// Order Archived - soft delete, nothing can happen to the order afterwards
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct OrderArchived {}
