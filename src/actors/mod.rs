// ============================================================================
// Actors Module
// ============================================================================
//
// kameo actors for the runtime's background work.
//
// Structure:
// - core/           - health types shared by the actors
// - infrastructure/ - outbox publisher, DLQ, health monitor, coordinator
//
// Note: commands never go through actors. An aggregate is only ever touched
//       inside the AggregateManager's unit of work.
//
// ============================================================================

// Private module declarations
mod core;
mod infrastructure;

pub use core::{ComponentHealth, HealthCheckable, HealthStatus};
pub use infrastructure::{
    AddToDlq, CheckHealth, CoordinatorActor, CoordinatorSetup, DlqActor, DlqStats, DrainNow,
    DrainOutbox, GetDlqMessages, GetDlqStats, GetPublisherStats, GetSystemHealth,
    HealthMonitorActor, OutboxPublisherActor, PublisherStats, Shutdown, SystemHealth, UpdateHealth,
};
