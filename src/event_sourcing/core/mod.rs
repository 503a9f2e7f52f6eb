// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Generic, reusable building blocks that work with ANY domain aggregate:
// the persisted event value, the registries, and the aggregate root.
//
// No domain-specific code lives here (no Order, Customer, ...).
//
// ============================================================================

pub mod aggregate;
pub mod event;
pub mod registry;

pub use aggregate::{Aggregate, AggregateRoot, CommandContext, Snapshot};
pub use event::{decode_as, DomainEvent, EventDescriptor, EventKey, EventSet, PayloadDecoder};
pub use registry::{AggregateMetadata, Registry, RegistryBuilder, SnapshotPolicy};
