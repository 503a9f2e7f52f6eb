use chrono::{SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::event::{DomainEvent, EventSet};
use super::registry::{AggregateMetadata, Registry};
use crate::error::{EsError, EsResult};

// ============================================================================
// Aggregate Root Pattern - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events only
// 2. Events carry a gap-free, per-aggregate sequence number starting at 1
// 3. Events are produced only while a command is executing (stage_event)
// 4. A staged event is applied immediately, so the command sees its effect
// 5. Deletion is a flag set by an event, never a physical delete
//
// `Aggregate` is the domain side (business fields + apply), `AggregateRoot`
// is the generic envelope that tracks identity, sequence and staged events.
//
// ============================================================================

/// Business state of an event-sourced aggregate.
///
/// `apply` must be deterministic: the same events in the same order always
/// produce the same state.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Event: EventSet;

    fn apply(&mut self, event: &Self::Event, envelope: &DomainEvent);

    /// The event that brings an instance into existence and fixes its identity
    fn is_creation(event: &Self::Event) -> bool;

    /// The event that soft-deletes an instance
    fn is_deletion(_event: &Self::Event) -> bool {
        false
    }
}

/// Causation and correlation data stamped onto every event staged by a command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
    pub triggered_by_event_id: Option<Uuid>,
    pub triggered_by_user_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a command run in reaction to `event`: keeps its tenant and
    /// correlation, and records it as the cause.
    pub fn caused_by(event: &DomainEvent) -> Self {
        Self {
            tenant_id: event.tenant_id.clone(),
            correlation_id: event.correlation_id.clone(),
            triggered_by_event_id: Some(event.id),
            triggered_by_user_id: event.triggered_by_user_id.clone(),
            metadata: HashMap::new(),
        }
    }

    /// An empty `tenant_id` leaves the context without a tenant.
    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string()).filter(|t| !t.is_empty());
        self
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.triggered_by_user_id = Some(user_id.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Persisted snapshot of an aggregate root at `sequence_number`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub origin: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub sequence_number: i64,
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct SnapshotData<A> {
    id: Option<String>,
    sequence_number: i64,
    is_deleted: bool,
    state: A,
}

pub struct AggregateRoot<A: Aggregate> {
    id: Option<String>,
    pending_identity: Option<String>,
    current_sequence_number: i64,
    is_deleted: bool,
    staged_events: Vec<DomainEvent>,
    context: Option<CommandContext>,
    state: A,
    metadata: AggregateMetadata,
    registry: Arc<Registry>,
}

impl<A: Aggregate> std::fmt::Debug for AggregateRoot<A>
where
    A: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("aggregate_type", &self.metadata.aggregate_type)
            .field("id", &self.id)
            .field("current_sequence_number", &self.current_sequence_number)
            .field("is_deleted", &self.is_deleted)
            .field("staged_events", &self.staged_events.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    /// An empty, identity-less root.
    pub fn new(registry: Arc<Registry>) -> EsResult<Self> {
        let metadata = registry.lookup::<A>()?.clone();
        Ok(Self {
            id: None,
            pending_identity: None,
            current_sequence_number: 0,
            is_deleted: false,
            staged_events: Vec::new(),
            context: None,
            state: A::default(),
            metadata,
            registry,
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn current_sequence_number(&self) -> i64 {
        self.current_sequence_number
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn metadata(&self) -> &AggregateMetadata {
        &self.metadata
    }

    pub fn staged_events(&self) -> &[DomainEvent] {
        &self.staged_events
    }

    pub fn in_command(&self) -> bool {
        self.context.is_some()
    }

    /// Apply a persisted event during replay.
    pub fn apply_event(&mut self, event: &DomainEvent) -> EsResult<()> {
        let typed: A::Event = self.registry.decode(event)?;
        self.apply_typed(&typed, event)
    }

    fn apply_typed(&mut self, typed: &A::Event, event: &DomainEvent) -> EsResult<()> {
        let expected = self.current_sequence_number + 1;
        if event.sequence_number != expected {
            return Err(EsError::SequenceMismatch {
                aggregate_id: event.aggregate_id.clone(),
                expected,
                actual: event.sequence_number,
            });
        }

        if A::is_creation(typed) {
            if let Some(id) = &self.id {
                return Err(EsError::SequenceMismatch {
                    aggregate_id: id.clone(),
                    expected: 1,
                    actual: event.sequence_number,
                });
            }
            self.id = Some(event.aggregate_id.clone());
            self.pending_identity = None;
        } else {
            match &self.id {
                None => {
                    return Err(EsError::UninitializedAggregate {
                        aggregate_id: event.aggregate_id.clone(),
                        event_type: event.event_type.clone(),
                        sequence_number: event.sequence_number,
                    })
                }
                Some(id) if *id != event.aggregate_id => {
                    return Err(EsError::AggregateIdMismatch {
                        expected: id.clone(),
                        actual: event.aggregate_id.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        self.state.apply(typed, event);
        if A::is_deletion(typed) {
            self.is_deleted = true;
        }
        self.current_sequence_number = event.sequence_number;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Command execution
    // ------------------------------------------------------------------------

    pub fn begin_command(&mut self, context: CommandContext) -> EsResult<()> {
        if self.context.is_some() {
            return Err(EsError::CommandInProgress);
        }
        self.context = Some(context);
        Ok(())
    }

    /// Leave the command context and hand over the staged events.
    pub fn end_command(&mut self) -> Vec<DomainEvent> {
        self.context = None;
        std::mem::take(&mut self.staged_events)
    }

    /// Fix the identity of a new aggregate. Only legal inside a command, once.
    pub fn set_identity(&mut self, id: &str) -> EsResult<()> {
        if self.context.is_none() {
            return Err(EsError::OutOfContextMutation);
        }
        if let Some(existing) = self.id.as_ref().or(self.pending_identity.as_ref()) {
            return Err(EsError::IdentityAlreadySet(existing.clone()));
        }
        self.pending_identity = Some(id.to_string());
        Ok(())
    }

    /// Produce a new event: stamp it, apply it, and buffer it for persistence.
    pub fn stage_event(&mut self, event: A::Event) -> EsResult<()> {
        let context = self.context.as_ref().ok_or(EsError::OutOfContextMutation)?;

        let aggregate_id = self
            .id
            .clone()
            .or_else(|| self.pending_identity.clone())
            .ok_or_else(|| {
                EsError::CommandRejected(format!(
                    "{} has no identity yet, call set_identity before staging its creation event",
                    self.metadata.aggregate_type
                ))
            })?;

        if self.id.is_none() && !A::is_creation(&event) {
            return Err(EsError::CommandRejected(format!(
                "{} {} does not exist yet, its first event must be a creation event",
                self.metadata.aggregate_type, aggregate_id
            )));
        }

        let key = event.key();
        if key.origin != self.metadata.origin || key.aggregate_type != self.metadata.aggregate_type {
            return Err(EsError::InvalidRegistration(format!(
                "event {} staged on aggregate {}/{}",
                key, self.metadata.origin, self.metadata.aggregate_type
            )));
        }

        let envelope = DomainEvent {
            origin: key.origin,
            aggregate_type: key.aggregate_type,
            event_type: key.event_type,
            version: key.version,
            id: Uuid::now_v7(),
            aggregate_id,
            sequence_number: self.current_sequence_number + 1,
            payload: event.to_payload()?,
            // Microseconds, the precision event stores keep
            timestamp: Utc::now().trunc_subsecs(6),
            tenant_id: context.tenant_id.clone(),
            correlation_id: context.correlation_id.clone(),
            triggered_by_event_id: context.triggered_by_event_id,
            triggered_by_user_id: context.triggered_by_user_id.clone(),
            metadata: context.metadata.clone(),
        };

        self.apply_typed(&event, &envelope)?;

        tracing::debug!(
            aggregate_id = %envelope.aggregate_id,
            sequence_number = envelope.sequence_number,
            event_type = %envelope.event_type,
            "Staged event"
        );

        self.staged_events.push(envelope);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    pub fn to_snapshot(&self) -> EsResult<Snapshot> {
        let aggregate_id = self.id.clone().ok_or_else(|| {
            EsError::CommandRejected("cannot snapshot an aggregate without identity".to_string())
        })?;
        let data = serde_json::to_value(SnapshotData {
            id: self.id.clone(),
            sequence_number: self.current_sequence_number,
            is_deleted: self.is_deleted,
            state: &self.state,
        })?;
        Ok(Snapshot {
            origin: self.metadata.origin.clone(),
            aggregate_type: self.metadata.aggregate_type.clone(),
            aggregate_id,
            sequence_number: self.current_sequence_number,
            data,
        })
    }

    /// Rebuild a root from a snapshot. The snapshot must restore to the
    /// sequence number it claims.
    pub fn restore(registry: Arc<Registry>, snapshot: &Snapshot) -> EsResult<Self> {
        let data: SnapshotData<A> = serde_json::from_value(snapshot.data.clone())?;
        if data.sequence_number != snapshot.sequence_number
            || data.id.as_deref() != Some(snapshot.aggregate_id.as_str())
        {
            return Err(EsError::SnapshotMismatch {
                aggregate_id: snapshot.aggregate_id.clone(),
                claimed: snapshot.sequence_number,
                restored: data.sequence_number,
            });
        }

        let mut root = Self::new(registry)?;
        root.id = data.id;
        root.current_sequence_number = data.sequence_number;
        root.is_deleted = data.is_deleted;
        root.state = data.state;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::event::{decode_as, EventDescriptor, EventKey};
    use crate::event_sourcing::core::registry::RegistryBuilder;
    use serde_json::Value;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Opened {
        owner: String,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Deposited {
        amount: i64,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Closed {}

    #[derive(Clone, Debug, PartialEq)]
    enum AccountEvent {
        Opened(Opened),
        Deposited(Deposited),
        Closed(Closed),
    }

    impl EventSet for AccountEvent {
        fn descriptors() -> Vec<EventDescriptor<Self>> {
            vec![
                EventDescriptor::new(EventKey::new("bank", "Account", "Opened", 1), |v| {
                    decode_as(v, AccountEvent::Opened)
                }),
                EventDescriptor::new(EventKey::new("bank", "Account", "Deposited", 1), |v| {
                    decode_as(v, AccountEvent::Deposited)
                }),
                EventDescriptor::new(EventKey::new("bank", "Account", "Closed", 1), |v| {
                    decode_as(v, AccountEvent::Closed)
                }),
            ]
        }

        fn key(&self) -> EventKey {
            let name = match self {
                AccountEvent::Opened(_) => "Opened",
                AccountEvent::Deposited(_) => "Deposited",
                AccountEvent::Closed(_) => "Closed",
            };
            EventKey::new("bank", "Account", name, 1)
        }

        fn to_payload(&self) -> EsResult<Value> {
            Ok(match self {
                AccountEvent::Opened(p) => serde_json::to_value(p)?,
                AccountEvent::Deposited(p) => serde_json::to_value(p)?,
                AccountEvent::Closed(p) => serde_json::to_value(p)?,
            })
        }
    }

    #[derive(Default, Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Account {
        owner: String,
        balance: i64,
    }

    impl Aggregate for Account {
        type Event = AccountEvent;

        fn apply(&mut self, event: &AccountEvent, _envelope: &DomainEvent) {
            match event {
                AccountEvent::Opened(p) => self.owner = p.owner.clone(),
                AccountEvent::Deposited(p) => self.balance += p.amount,
                AccountEvent::Closed(_) => {}
            }
        }

        fn is_creation(event: &AccountEvent) -> bool {
            matches!(event, AccountEvent::Opened(_))
        }

        fn is_deletion(event: &AccountEvent) -> bool {
            matches!(event, AccountEvent::Closed(_))
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(
            RegistryBuilder::new("bank")
                .register_aggregate::<Account>(crate::event_sourcing::AggregateMetadata::new(
                    "bank", "Account",
                ))
                .unwrap()
                .build(),
        )
    }

    fn opened_root() -> AggregateRoot<Account> {
        let mut root = AggregateRoot::<Account>::new(registry()).unwrap();
        root.begin_command(CommandContext::new().with_tenant("t1")).unwrap();
        root.set_identity("acc-1").unwrap();
        root.stage_event(AccountEvent::Opened(Opened {
            owner: "ada".to_string(),
        }))
        .unwrap();
        root
    }

    #[test]
    fn test_stage_event_applies_and_stamps() {
        let mut root = opened_root();
        root.stage_event(AccountEvent::Deposited(Deposited { amount: 50 }))
            .unwrap();

        assert_eq!(root.id(), Some("acc-1"));
        assert_eq!(root.current_sequence_number(), 2);
        assert_eq!(root.state().balance, 50);

        let staged = root.end_command();
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[0].sequence_number, 1);
        assert_eq!(staged[1].sequence_number, 2);
        assert_eq!(staged[1].event_type, "Deposited");
        assert_eq!(staged[1].tenant_id.as_deref(), Some("t1"));
        assert!(root.staged_events().is_empty());
        assert!(!root.in_command());
    }

    #[test]
    fn test_stage_outside_command_fails() {
        let mut root = opened_root();
        root.end_command();
        let err = root
            .stage_event(AccountEvent::Deposited(Deposited { amount: 1 }))
            .unwrap_err();
        assert!(matches!(err, EsError::OutOfContextMutation));
    }

    #[test]
    fn test_identity_can_only_be_set_once() {
        let mut root = opened_root();
        let err = root.set_identity("acc-2").unwrap_err();
        assert!(matches!(err, EsError::IdentityAlreadySet(id) if id == "acc-1"));
    }

    #[test]
    fn test_nested_command_rejected() {
        let mut root = opened_root();
        assert!(matches!(
            root.begin_command(CommandContext::new()),
            Err(EsError::CommandInProgress)
        ));
    }

    #[test]
    fn test_replay_rejects_gaps() {
        let mut source = opened_root();
        source
            .stage_event(AccountEvent::Deposited(Deposited { amount: 1 }))
            .unwrap();
        source
            .stage_event(AccountEvent::Deposited(Deposited { amount: 2 }))
            .unwrap();
        let events = source.end_command();

        let mut replay = AggregateRoot::<Account>::new(registry()).unwrap();
        replay.apply_event(&events[0]).unwrap();
        let err = replay.apply_event(&events[2]).unwrap_err();
        assert!(matches!(
            err,
            EsError::SequenceMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_second_creation_event_rejected() {
        let mut source = opened_root();
        let events = source.end_command();

        let mut replay = AggregateRoot::<Account>::new(registry()).unwrap();
        replay.apply_event(&events[0]).unwrap();

        let mut again = events[0].clone();
        again.sequence_number = 2;
        assert!(matches!(
            replay.apply_event(&again),
            Err(EsError::SequenceMismatch { .. })
        ));
    }

    #[test]
    fn test_non_creation_first_event_is_uninitialized() {
        let mut source = opened_root();
        source
            .stage_event(AccountEvent::Deposited(Deposited { amount: 5 }))
            .unwrap();
        let mut events = source.end_command();
        events[1].sequence_number = 1;

        let mut replay = AggregateRoot::<Account>::new(registry()).unwrap();
        assert!(matches!(
            replay.apply_event(&events[1]),
            Err(EsError::UninitializedAggregate { .. })
        ));
    }

    #[test]
    fn test_non_creation_event_on_fresh_root_is_rejected() {
        let mut root = AggregateRoot::<Account>::new(registry()).unwrap();
        root.begin_command(CommandContext::new()).unwrap();
        root.set_identity("acc-1").unwrap();

        let err = root
            .stage_event(AccountEvent::Deposited(Deposited { amount: 5 }))
            .unwrap_err();
        assert!(matches!(err, EsError::CommandRejected(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Rejected);
        assert!(root.end_command().is_empty());
    }

    #[test]
    fn test_staged_timestamps_have_microsecond_precision() {
        let mut root = opened_root();
        for amount in 1..=20 {
            root.stage_event(AccountEvent::Deposited(Deposited { amount }))
                .unwrap();
        }
        for event in root.end_command() {
            assert_eq!(event.timestamp.timestamp_subsec_nanos() % 1_000, 0);
        }
    }

    #[test]
    fn test_deletion_sets_flag() {
        let mut root = opened_root();
        root.stage_event(AccountEvent::Closed(Closed {})).unwrap();
        assert!(root.is_deleted());
    }

    #[test]
    fn test_snapshot_restores_same_state() {
        let mut root = opened_root();
        root.stage_event(AccountEvent::Deposited(Deposited { amount: 9 }))
            .unwrap();
        root.end_command();

        let snapshot = root.to_snapshot().unwrap();
        assert_eq!(snapshot.sequence_number, 2);

        let restored = AggregateRoot::<Account>::restore(registry(), &snapshot).unwrap();
        assert_eq!(restored.state(), root.state());
        assert_eq!(restored.current_sequence_number(), 2);
        assert_eq!(restored.id(), Some("acc-1"));
    }

    #[test]
    fn test_snapshot_claiming_wrong_sequence_rejected() {
        let mut root = opened_root();
        root.end_command();
        let mut snapshot = root.to_snapshot().unwrap();
        snapshot.sequence_number = 5;

        assert!(matches!(
            AggregateRoot::<Account>::restore(registry(), &snapshot),
            Err(EsError::SnapshotMismatch {
                claimed: 5,
                restored: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_caused_by_propagates_correlation() {
        let mut root = opened_root();
        let events = root.end_command();
        let ctx = CommandContext::caused_by(&events[0]);
        assert_eq!(ctx.triggered_by_event_id, Some(events[0].id));
        assert_eq!(ctx.tenant_id.as_deref(), Some("t1"));
    }
}
