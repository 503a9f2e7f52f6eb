use std::time::Duration;
use uuid::Uuid;

use crate::utils::IsTransient;

// ============================================================================
// Event Sourcing Errors
// ============================================================================
//
// One error type for the whole runtime. Variants are grouped by how the
// caller is expected to react:
//
// - Configuration: fatal, raised at startup or construction, never retried
// - Concurrency:   expected under contention, rebuild and retry the command
// - Corruption:    a broken log invariant, halt processing of the aggregate
// - Transient:     infrastructure hiccup, retried by the collaborator
// - Rejected:      the caller misused the API or the command was refused
//
// Duplicate delivery is not an error for callers. `LedgerConflict` only
// travels from a store to the idempotent consumer, which turns it into
// ConsumeOutcome::Duplicate.
//
// ============================================================================

/// How a caller should react to an [`EsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Concurrency,
    Corruption,
    Transient,
    Rejected,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum EsError {
    // --- Configuration -----------------------------------------------------
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    #[error("no aggregate metadata registered for {0}")]
    MetadataNotFound(&'static str),

    #[error("no domain event registered for {0}")]
    EventNotRegistered(String),

    #[error("event {key} is registered for {registered}, not {requested}")]
    EventTypeMismatch {
        key: String,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("incomplete messaging configuration: {0}")]
    IncompleteMessagingConfiguration(&'static str),

    #[error("aggregate {aggregate_type} belongs to origin {origin}, not the local origin {local_origin}")]
    ForeignAggregate {
        origin: String,
        aggregate_type: String,
        local_origin: String,
    },

    #[error("no process-wide registry installed")]
    RegistryNotInstalled,

    #[error("no query service configured for origin {0}")]
    RemoteOriginNotConfigured(String),

    // --- Concurrency -------------------------------------------------------
    #[error("concurrent modification of aggregate {aggregate_id}: expected head {expected}, found {actual}")]
    ConcurrentModification {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("message {event_id} already consumed by {consumer_id}")]
    LedgerConflict { event_id: Uuid, consumer_id: String },

    // --- Corruption --------------------------------------------------------
    #[error("sequence mismatch on aggregate {aggregate_id}: expected {expected}, got {actual}")]
    SequenceMismatch {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("event {event_type} (seq {sequence_number}) applied to aggregate {aggregate_id} before its creation event")]
    UninitializedAggregate {
        aggregate_id: String,
        event_type: String,
        sequence_number: i64,
    },

    #[error("event for aggregate {actual} applied to aggregate {expected}")]
    AggregateIdMismatch { expected: String, actual: String },

    #[error("snapshot of aggregate {aggregate_id} claims sequence {claimed} but restores to {restored}")]
    SnapshotMismatch {
        aggregate_id: String,
        claimed: i64,
        restored: i64,
    },

    // --- Transient ---------------------------------------------------------
    #[error("store error: {0}")]
    Store(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("transaction timed out after {0:?}")]
    TransactionTimeout(Duration),

    // --- Rejected ----------------------------------------------------------
    #[error("events can only be staged inside a command")]
    OutOfContextMutation,

    #[error("aggregate identity is already set to {0}")]
    IdentityAlreadySet(String),

    #[error("a command is already executing against this aggregate")]
    CommandInProgress,

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Not found ---------------------------------------------------------
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),
}

impl EsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EsError::AlreadyRegistered(_)
            | EsError::MetadataNotFound(_)
            | EsError::EventNotRegistered(_)
            | EsError::EventTypeMismatch { .. }
            | EsError::InvalidRegistration(_)
            | EsError::IncompleteMessagingConfiguration(_)
            | EsError::ForeignAggregate { .. }
            | EsError::RegistryNotInstalled
            | EsError::RemoteOriginNotConfigured(_) => ErrorKind::Configuration,
            EsError::ConcurrentModification { .. } | EsError::LedgerConflict { .. } => {
                ErrorKind::Concurrency
            }
            EsError::SequenceMismatch { .. }
            | EsError::UninitializedAggregate { .. }
            | EsError::AggregateIdMismatch { .. }
            | EsError::SnapshotMismatch { .. } => ErrorKind::Corruption,
            EsError::Store(_) | EsError::Messaging(_) | EsError::TransactionTimeout(_) => {
                ErrorKind::Transient
            }
            EsError::OutOfContextMutation
            | EsError::IdentityAlreadySet(_)
            | EsError::CommandInProgress
            | EsError::CommandRejected(_)
            | EsError::Serialization(_) => ErrorKind::Rejected,
            EsError::AggregateNotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EsError::ConcurrentModification { .. })
    }
}

impl IsTransient for EsError {
    fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Concurrency | ErrorKind::Transient)
    }
}

impl From<sqlx::Error> for EsError {
    fn from(err: sqlx::Error) -> Self {
        EsError::Store(err.to_string())
    }
}

pub type EsResult<T> = Result<T, EsError>;
