use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{MessageConsumer, MessageHandler, MessageProducer, WireMessage};
use crate::actors::HealthStatus;
use crate::error::{EsError, EsResult};

// ============================================================================
// In-Memory Broker
// ============================================================================
//
// Producer and consumer in one. Every published message is kept in a log
// (so tests can inspect and redeliver it) and handed to the current
// subscribers of its channel, one after another, in publish order.
//
// ============================================================================

#[derive(Default)]
struct BrokerState {
    log: Vec<(String, WireMessage)>,
    subscribers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
    fail_next_publishes: u32,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with a messaging error.
    pub async fn fail_next_publishes(&self, n: u32) {
        self.state.lock().await.fail_next_publishes = n;
    }

    /// Messages published on `channel_id`, oldest first
    pub async fn published(&self, channel_id: &str) -> Vec<WireMessage> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|(channel, _)| channel == channel_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub async fn published_count(&self) -> usize {
        self.state.lock().await.log.len()
    }

    /// Hand every message ever published on `channel_id` to its subscribers
    /// again, the way a consumer restarting from an old offset would see them.
    pub async fn redeliver(&self, channel_id: &str) -> EsResult<usize> {
        let messages = self.published(channel_id).await;
        for message in &messages {
            self.deliver(channel_id, message).await;
        }
        Ok(messages.len())
    }

    async fn deliver(&self, channel_id: &str, message: &WireMessage) {
        let handlers = self
            .state
            .lock()
            .await
            .subscribers
            .get(channel_id)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = handler.handle(message.clone()).await {
                tracing::warn!(
                    channel_id = %channel_id,
                    key = %message.key,
                    error = %e,
                    "In-memory subscriber failed to handle message"
                );
            }
        }
    }
}

#[async_trait]
impl MessageProducer for InMemoryBroker {
    async fn publish(&self, channel_id: &str, message: &WireMessage) -> EsResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.fail_next_publishes > 0 {
                state.fail_next_publishes -= 1;
                return Err(EsError::Messaging(format!(
                    "in-memory broker refused publish to {}",
                    channel_id
                )));
            }
            state.log.push((channel_id.to_string(), message.clone()));
        }

        tracing::debug!(channel_id = %channel_id, key = %message.key, "Published to in-memory broker");
        self.deliver(channel_id, message).await;
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        if self.state.lock().await.fail_next_publishes > 0 {
            HealthStatus::Degraded("publishes are being refused".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

#[async_trait]
impl MessageConsumer for InMemoryBroker {
    async fn subscribe(&self, channel_id: &str, handler: Arc<dyn MessageHandler>) -> EsResult<()> {
        self.state
            .lock()
            .await
            .subscribers
            .entry(channel_id.to_string())
            .or_default()
            .push(handler);
        tracing::info!(channel_id = %channel_id, "Subscribed to in-memory channel");
        Ok(())
    }
}
