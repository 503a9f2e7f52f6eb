// ============================================================================
// es_runtime - Event Sourcing Runtime
// ============================================================================
//
// Aggregates rebuilt from an append-only event log, commands executed in one
// transaction together with a transactional outbox, an outbox publisher that
// delivers to a message broker, and an idempotent consumer on the other side.
//
// ============================================================================

pub mod actors;
pub mod config;
pub mod consumer;
pub mod domain;
pub mod error;
pub mod event_sourcing;
pub mod messaging;
pub mod metrics;
pub mod outbox;
pub mod utils;

pub use config::{ConfigError, RuntimeConfig};
pub use error::{EsError, EsResult, ErrorKind};
