// ============================================================================
// Order Domain - Business Logic for Order Aggregate
// ============================================================================
//
// Sample domain running on the event sourcing runtime:
// - Value objects (OrderItem, OrderStatus)
// - Events (OrderCreated ... OrderArchived) and their registry descriptors
// - Commands and business rule errors
// - Aggregate (OrderAggregate, decides and applies)
// - Command handler on top of AggregateManager
// - Summary projection fed by the idempotent consumer
//
// ============================================================================

pub mod aggregate;
pub mod command_handler;
pub mod commands;
pub mod errors;
pub mod events;
pub mod projection;
pub mod value_objects;

pub use aggregate::*;
pub use command_handler::*;
pub use commands::*;
pub use errors::*;
pub use events::*;
pub use projection::*;
pub use value_objects::*;

use crate::error::EsResult;
use crate::event_sourcing::{AggregateMetadata, RegistryBuilder, SnapshotPolicy};

/// Origin that owns orders
pub const ORDER_ORIGIN: &str = "orders-service";
pub const ORDER_AGGREGATE_TYPE: &str = "Order";

/// Register the order aggregate and its events. `snapshot_every` of `None`
/// disables snapshots.
pub fn register(builder: RegistryBuilder, snapshot_every: Option<u32>) -> EsResult<RegistryBuilder> {
    let mut metadata = AggregateMetadata::new(ORDER_ORIGIN, ORDER_AGGREGATE_TYPE);
    if let Some(n) = snapshot_every {
        metadata = metadata.with_snapshot_policy(SnapshotPolicy::EveryNEvents(n));
    }
    builder.register_aggregate::<OrderAggregate>(metadata)
}
