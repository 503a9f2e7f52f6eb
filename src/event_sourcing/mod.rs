// ============================================================================
// Event Sourcing Runtime
// ============================================================================
//
// Generic, reusable event sourcing infrastructure.
// Domain-specific code is in src/domain/
//
// core/       - events, aggregate root, registries
// store/      - persistence collaborators and the two backends
// factory.rs  - rehydration (snapshot + event suffix)
// manager.rs  - one command = one transaction
// query.rs    - read path, local or through the owning service
//
// ============================================================================

pub mod core;
pub mod factory;
pub mod manager;
pub mod query;
pub mod store;

pub use self::core::*;
pub use factory::AggregateFactory;
pub use manager::{AggregateManager, AggregateManagerBuilder, CommandOutcome};
pub use query::{AggregateQueryService, LocalQueryEndpoint, RemoteAggregateQuery};
pub use store::{
    ConsumedMessage, ConsumedMessageStore, DeadLetter, DeadLetterStore, EventStore, InMemoryBackend,
    InMemoryTx, OutboxDrain, OutboxStore, PgBackend, PgTx, SnapshotStore, StoreSet,
    TransactionManager,
};
