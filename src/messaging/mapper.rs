use super::WireMessage;
use crate::error::{EsError, EsResult};
use crate::event_sourcing::DomainEvent;

pub trait OutboundMessageMapper: Send + Sync {
    fn to_message(&self, event: &DomainEvent) -> EsResult<WireMessage>;
}

pub trait InboundMessageMapper: Send + Sync {
    fn to_event(&self, message: &WireMessage) -> EsResult<DomainEvent>;
}

/// The whole event as the JSON body, keyed by aggregate id so a partitioned
/// transport keeps per-aggregate order. Registry key fields are duplicated
/// into headers for routing and filtering.
#[derive(Clone, Debug, Default)]
pub struct JsonMessageMapper;

impl OutboundMessageMapper for JsonMessageMapper {
    fn to_message(&self, event: &DomainEvent) -> EsResult<WireMessage> {
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("event_id".to_string(), event.id.to_string());
        headers.insert("origin".to_string(), event.origin.clone());
        headers.insert("aggregate_type".to_string(), event.aggregate_type.clone());
        headers.insert("event_type".to_string(), event.event_type.clone());
        headers.insert("event_version".to_string(), event.version.to_string());
        headers.insert(
            "sequence_number".to_string(),
            event.sequence_number.to_string(),
        );
        if let Some(tenant) = &event.tenant_id {
            headers.insert("tenant_id".to_string(), tenant.clone());
        }
        if let Some(correlation) = &event.correlation_id {
            headers.insert("correlation_id".to_string(), correlation.clone());
        }

        Ok(WireMessage {
            key: event.aggregate_id.clone(),
            headers,
            payload: serde_json::to_string(event)?,
        })
    }
}

impl InboundMessageMapper for JsonMessageMapper {
    fn to_event(&self, message: &WireMessage) -> EsResult<DomainEvent> {
        let event: DomainEvent = serde_json::from_str(&message.payload)?;
        if event.aggregate_id != message.key {
            return Err(EsError::CommandRejected(format!(
                "message key {} does not match aggregate id {}",
                message.key, event.aggregate_id
            )));
        }
        Ok(event)
    }
}
