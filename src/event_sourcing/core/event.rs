use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::EsResult;

// ============================================================================
// Domain Event - the persisted, immutable fact
// ============================================================================
//
// A flat value struct. The typed payload lives in `payload` as JSON and is
// turned back into the aggregate's event enum through the registry, keyed by
// (origin, aggregate_type, event_type, version).
//
// A payload shape never changes in place: a schema change gets a new version
// and a new registry entry.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DomainEvent {
    // Registry identity
    pub origin: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub version: i32,

    // Event identity
    pub id: Uuid,
    pub aggregate_id: String,
    pub sequence_number: i64,

    pub payload: Value,
    pub timestamp: DateTime<Utc>,

    // Causation & correlation
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
    pub triggered_by_event_id: Option<Uuid>,
    pub triggered_by_user_id: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DomainEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(
            &self.origin,
            &self.aggregate_type,
            &self.event_type,
            self.version,
        )
    }
}

/// Registry lookup key of a domain event
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub origin: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub version: i32,
}

impl EventKey {
    pub fn new(origin: &str, aggregate_type: &str, event_type: &str, version: i32) -> Self {
        Self {
            origin: origin.to_string(),
            aggregate_type: aggregate_type.to_string(),
            event_type: event_type.to_string(),
            version,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@v{}",
            self.origin, self.aggregate_type, self.event_type, self.version
        )
    }
}

// ============================================================================
// Event Set - the typed side of an aggregate's events
// ============================================================================

/// Decodes one registered event shape from its JSON payload.
pub type PayloadDecoder<E> = fn(&Value) -> Result<E, serde_json::Error>;

/// One registrable (key, decoder) pair of an event set.
pub struct EventDescriptor<E> {
    pub key: EventKey,
    pub decode: PayloadDecoder<E>,
}

impl<E> EventDescriptor<E> {
    pub fn new(key: EventKey, decode: PayloadDecoder<E>) -> Self {
        Self { key, decode }
    }
}

impl<E> Clone for EventDescriptor<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            decode: self.decode,
        }
    }
}

/// The closed set of events one aggregate type emits.
///
/// Usually an enum with one variant per event type. Every variant must have a
/// descriptor so that persisted events can be decoded back through the
/// registry.
pub trait EventSet: Clone + Send + Sync + Sized + 'static {
    fn descriptors() -> Vec<EventDescriptor<Self>>;

    /// Registry key of this particular variant
    fn key(&self) -> EventKey;

    fn to_payload(&self) -> EsResult<Value>;
}

/// Decode helper for descriptor tables: `decode_as::<OrderCreated, _>(OrderEvent::Created)`
pub fn decode_as<P, E>(payload: &Value, wrap: fn(P) -> E) -> Result<E, serde_json::Error>
where
    P: for<'de> Deserialize<'de>,
{
    serde_json::from_value::<P>(payload.clone()).map(wrap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> DomainEvent {
        DomainEvent {
            origin: "orders-service".to_string(),
            aggregate_type: "Order".to_string(),
            event_type: "OrderCreated".to_string(),
            version: 1,
            id: Uuid::now_v7(),
            aggregate_id: "A1".to_string(),
            sequence_number: 1,
            payload: serde_json::json!({ "customer_id": "C1" }),
            timestamp: Utc::now(),
            tenant_id: Some("tenant-a".to_string()),
            correlation_id: Some("corr-1".to_string()),
            triggered_by_event_id: None,
            triggered_by_user_id: Some("user-7".to_string()),
            metadata: HashMap::from([("source".to_string(), "test".to_string())]),
        }
    }

    #[test]
    fn test_event_key_display() {
        let key = sample_event().key();
        assert_eq!(key.to_string(), "orders-service/Order/OrderCreated@v1");
    }

    #[test]
    fn test_domain_event_json_preserves_all_fields() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_missing_metadata_defaults_to_empty() {
        let mut json = serde_json::to_value(sample_event()).unwrap();
        json.as_object_mut().unwrap().remove("metadata");
        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert!(back.metadata.is_empty());
    }

    #[test]
    fn test_decode_as_wraps_payload() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Renamed {
            name: String,
        }
        #[derive(Debug, PartialEq)]
        enum Ev {
            Renamed(Renamed),
        }

        let decoded = decode_as(&serde_json::json!({ "name": "x" }), Ev::Renamed).unwrap();
        assert_eq!(
            decoded,
            Ev::Renamed(Renamed {
                name: "x".to_string()
            })
        );
    }
}
