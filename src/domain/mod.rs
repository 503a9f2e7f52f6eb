// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Domain-specific aggregates built on the event sourcing runtime. Each
// aggregate has its own subdirectory with value objects, events, commands,
// errors, the aggregate itself, a command handler and its projections.
//
// ============================================================================

pub mod order;
