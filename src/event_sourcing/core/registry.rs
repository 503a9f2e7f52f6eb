use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::aggregate::Aggregate;
use super::event::{DomainEvent, EventKey, EventSet, PayloadDecoder};
use crate::error::{EsError, EsResult};

// ============================================================================
// Aggregate Metadata & Domain Event Registries
// ============================================================================
//
// Pure lookup tables, filled once at startup through `RegistryBuilder` and
// frozen afterwards. Every component receives the frozen `Arc<Registry>`
// explicitly. For code that cannot thread it through, a process-wide
// instance can be installed once and torn down again (tests do this between
// cases).
//
// ============================================================================

/// When the manager writes a snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// Snapshot whenever a unit of work crosses a multiple of `n`
    EveryNEvents(u32),
}

impl SnapshotPolicy {
    pub fn should_snapshot(&self, previous_head: i64, new_head: i64) -> bool {
        match *self {
            SnapshotPolicy::EveryNEvents(0) => false,
            SnapshotPolicy::EveryNEvents(n) => {
                let n = i64::from(n);
                new_head / n > previous_head / n
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateMetadata {
    pub origin: String,
    pub aggregate_type: String,
    pub snapshot_policy: Option<SnapshotPolicy>,
}

impl AggregateMetadata {
    pub fn new(origin: &str, aggregate_type: &str) -> Self {
        Self {
            origin: origin.to_string(),
            aggregate_type: aggregate_type.to_string(),
            snapshot_policy: None,
        }
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(policy);
        self
    }
}

struct EventEntry {
    set_type: TypeId,
    set_name: &'static str,
    // Holds a `PayloadDecoder<E>` for `E` = the type behind `set_type`
    decoder: Box<dyn Any + Send + Sync>,
}

struct AggregateEntry {
    type_name: &'static str,
    metadata: AggregateMetadata,
}

pub struct Registry {
    local_origin: String,
    aggregates: HashMap<TypeId, AggregateEntry>,
    aggregate_names: HashMap<(String, String), TypeId>,
    events: HashMap<EventKey, EventEntry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("local_origin", &self.local_origin)
            .field("aggregates", &self.aggregate_names.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Registry {
    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    pub fn is_local(&self, metadata: &AggregateMetadata) -> bool {
        metadata.origin == self.local_origin
    }

    /// Metadata of a registered aggregate type
    pub fn lookup<A: 'static>(&self) -> EsResult<&AggregateMetadata> {
        self.aggregates
            .get(&TypeId::of::<A>())
            .map(|entry| &entry.metadata)
            .ok_or(EsError::MetadataNotFound(std::any::type_name::<A>()))
    }

    pub fn find_by_name(&self, origin: &str, aggregate_type: &str) -> Option<&AggregateMetadata> {
        self.aggregate_names
            .get(&(origin.to_string(), aggregate_type.to_string()))
            .and_then(|type_id| self.aggregates.get(type_id))
            .map(|entry| &entry.metadata)
    }

    pub fn is_event_registered(&self, key: &EventKey) -> bool {
        self.events.contains_key(key)
    }

    pub fn event_keys(&self) -> impl Iterator<Item = &EventKey> {
        self.events.keys()
    }

    /// Turn a persisted event back into its typed variant.
    pub fn decode<E: EventSet>(&self, event: &DomainEvent) -> EsResult<E> {
        let key = event.key();
        let entry = self
            .events
            .get(&key)
            .ok_or_else(|| EsError::EventNotRegistered(key.to_string()))?;

        let decoder = entry
            .decoder
            .downcast_ref::<PayloadDecoder<E>>()
            .filter(|_| entry.set_type == TypeId::of::<E>())
            .ok_or_else(|| EsError::EventTypeMismatch {
                key: key.to_string(),
                registered: entry.set_name,
                requested: std::any::type_name::<E>(),
            })?;

        Ok(decoder(&event.payload)?)
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    pub fn new(local_origin: &str) -> Self {
        Self {
            registry: Registry {
                local_origin: local_origin.to_string(),
                aggregates: HashMap::new(),
                aggregate_names: HashMap::new(),
                events: HashMap::new(),
            },
        }
    }

    /// Register an aggregate type together with every event it emits.
    pub fn register_aggregate<A: Aggregate>(mut self, metadata: AggregateMetadata) -> EsResult<Self> {
        let type_name = std::any::type_name::<A>();
        let name_key = (metadata.origin.clone(), metadata.aggregate_type.clone());

        if self.registry.aggregates.contains_key(&TypeId::of::<A>()) {
            return Err(EsError::AlreadyRegistered(type_name.to_string()));
        }
        if let Some(existing) = self
            .registry
            .aggregate_names
            .get(&name_key)
            .and_then(|type_id| self.registry.aggregates.get(type_id))
        {
            return Err(EsError::AlreadyRegistered(format!(
                "{}/{} (already bound to {})",
                metadata.origin, metadata.aggregate_type, existing.type_name
            )));
        }

        for descriptor in A::Event::descriptors() {
            if descriptor.key.origin != metadata.origin
                || descriptor.key.aggregate_type != metadata.aggregate_type
            {
                return Err(EsError::InvalidRegistration(format!(
                    "event {} does not belong to aggregate {}/{}",
                    descriptor.key, metadata.origin, metadata.aggregate_type
                )));
            }
        }

        self = self.register_events::<A::Event>()?;

        tracing::debug!(
            origin = %metadata.origin,
            aggregate_type = %metadata.aggregate_type,
            snapshot_policy = ?metadata.snapshot_policy,
            "Registered aggregate"
        );

        self.registry.aggregate_names.insert(name_key, TypeId::of::<A>());
        self.registry
            .aggregates
            .insert(TypeId::of::<A>(), AggregateEntry { type_name, metadata });
        Ok(self)
    }

    /// Register an event set on its own, e.g. events consumed from another origin.
    pub fn register_events<E: EventSet>(mut self) -> EsResult<Self> {
        let descriptors = E::descriptors();
        if descriptors.is_empty() {
            return Err(EsError::InvalidRegistration(format!(
                "{} declares no events",
                std::any::type_name::<E>()
            )));
        }

        for descriptor in descriptors {
            if self.registry.events.contains_key(&descriptor.key) {
                return Err(EsError::AlreadyRegistered(descriptor.key.to_string()));
            }
            self.registry.events.insert(
                descriptor.key,
                EventEntry {
                    set_type: TypeId::of::<E>(),
                    set_name: std::any::type_name::<E>(),
                    decoder: Box::new(descriptor.decode),
                },
            );
        }
        Ok(self)
    }

    pub fn build(self) -> Registry {
        tracing::info!(
            local_origin = %self.registry.local_origin,
            aggregates = self.registry.aggregates.len(),
            events = self.registry.events.len(),
            aggregate_types = ?self
                .registry
                .aggregates
                .values()
                .map(|entry| entry.type_name)
                .collect::<Vec<_>>(),
            "Registry built"
        );
        self.registry
    }
}

// ============================================================================
// Process-wide instance
// ============================================================================

static GLOBAL: RwLock<Option<Arc<Registry>>> = RwLock::new(None);

/// Install the process-wide registry. Fails if one is already installed.
pub fn install(registry: Registry) -> EsResult<Arc<Registry>> {
    let mut slot = GLOBAL.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.is_some() {
        return Err(EsError::AlreadyRegistered("process-wide registry".to_string()));
    }
    let registry = Arc::new(registry);
    *slot = Some(registry.clone());
    Ok(registry)
}

pub fn global() -> EsResult<Arc<Registry>> {
    GLOBAL
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
        .ok_or(EsError::RegistryNotInstalled)
}

/// Remove the process-wide registry so a fresh one can be installed.
pub fn teardown() {
    let mut slot = GLOBAL.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = None;
}
