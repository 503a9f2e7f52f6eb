// ============================================================================
// Message Broker Adapter
// ============================================================================
//
// The runtime never talks to a transport directly. It sees:
// - a producer that publishes a wire message to a channel
// - a consumer that delivers wire messages from a channel to a handler
// - a channel participant that names channels for (origin, aggregate type)
// - mappers that turn a DomainEvent into a wire message and back
//
// Two transports ship with the crate: an in-memory broker (tests, local
// runs) and Redpanda/Kafka via rdkafka.
//
// ============================================================================

mod channel;
mod in_memory;
mod mapper;
mod redpanda;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::actors::HealthStatus;
use crate::error::EsResult;

pub use channel::{InMemoryChannelParticipant, KafkaChannelParticipant, MessageChannelParticipant};
pub use in_memory::InMemoryBroker;
pub use mapper::{InboundMessageMapper, JsonMessageMapper, OutboundMessageMapper};
pub use redpanda::{RedpandaClient, RedpandaConsumer};

/// What travels over the broker: partition key, string headers, JSON body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: String,
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn publish(&self, channel_id: &str, message: &WireMessage) -> EsResult<()>;

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: WireMessage) -> EsResult<()>;
}

#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn subscribe(&self, channel_id: &str, handler: Arc<dyn MessageHandler>) -> EsResult<()>;
}
