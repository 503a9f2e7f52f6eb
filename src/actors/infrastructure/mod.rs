// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// Actors for the runtime's background concerns:
// - outbox publishing
// - dead letter queue
// - health monitoring
// - coordination and shutdown
//
// ============================================================================

// Private module declarations
mod coordinator;
mod dlq;
mod health_monitor;
mod outbox_publisher;

// Re-export for public API
pub use coordinator::{CheckHealth, CoordinatorActor, CoordinatorSetup, DrainNow, Shutdown};
pub use dlq::{AddToDlq, DlqActor, DlqStats, GetDlqMessages, GetDlqStats};
pub use health_monitor::{GetSystemHealth, HealthMonitorActor, SystemHealth, UpdateHealth};
pub use outbox_publisher::{DrainOutbox, GetPublisherStats, OutboxPublisherActor, PublisherStats};
