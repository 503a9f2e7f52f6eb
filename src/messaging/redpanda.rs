use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{MessageConsumer, MessageHandler, MessageProducer, WireMessage};
use crate::actors::HealthStatus;
use crate::error::{EsError, EsResult};
use crate::metrics::Metrics;
use crate::utils::{
    retry_on_transient, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    RetryConfig, RetryResult,
};

// ============================================================================
// Redpanda / Kafka Producer
// ============================================================================

pub struct RedpandaClient {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
    send_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl RedpandaClient {
    pub fn new(brokers: &str) -> EsResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| EsError::Messaging(format!("failed to create Redpanda producer: {}", e)))?;

        let cb_config = CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        };

        Ok(Self {
            producer,
            circuit_breaker: CircuitBreaker::new("redpanda-producer", cb_config),
            send_timeout: Duration::from_secs(5),
            metrics: None,
        })
    }

    /// Mirror the circuit breaker state into the `circuit_breaker_state` gauge
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state().await
    }

    pub async fn reset_circuit_breaker(&self) {
        self.circuit_breaker.reset().await;
    }

    fn headers(message: &WireMessage) -> OwnedHeaders {
        message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

#[async_trait]
impl MessageProducer for RedpandaClient {
    async fn publish(&self, channel_id: &str, message: &WireMessage) -> EsResult<()> {
        let result = self
            .circuit_breaker
            .call(async {
                let record = FutureRecord::to(channel_id)
                    .key(&message.key)
                    .payload(&message.payload)
                    .headers(Self::headers(message));

                self.producer
                    .send(record, Timeout::After(self.send_timeout))
                    .await
                    .map(|_| ())
                    .map_err(|(e, _)| EsError::Messaging(format!("Kafka send error: {}", e)))
            })
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.update_circuit_breaker_state(self.circuit_breaker.state().await.as_gauge());
        }

        match result {
            Ok(()) => {
                tracing::debug!(channel_id = %channel_id, key = %message.key, "Published to Redpanda");
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(channel_id = %channel_id, "Circuit breaker open - Redpanda unavailable");
                Err(EsError::Messaging("circuit breaker open for Redpanda".to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, channel_id = %channel_id, "Failed to publish to Redpanda");
                Err(e)
            }
        }
    }

    async fn health(&self) -> HealthStatus {
        match self.circuit_breaker.state().await {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded("circuit breaker half-open".to_string()),
            CircuitState::Open => HealthStatus::Unhealthy("circuit breaker open".to_string()),
        }
    }
}

// ============================================================================
// Redpanda / Kafka Consumer
// ============================================================================
//
// One StreamConsumer per subscription, auto-commit off. An offset is
// committed only after the handler returned Ok, so delivery is at least once.
//
// Per message:
// - handled                 -> commit
// - transient failure       -> keep retrying the same message with backoff
// - unreadable or permanent -> log, count, commit and move on
//
// A message that can never be handled must not stall the partition: no
// later message would ever be consumed.
//
// ============================================================================

/// What the subscription loop does with a message after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Commit,
    Retry,
    Skip,
}

fn disposition(outcome: &RetryResult<(), EsError>) -> Disposition {
    match outcome {
        RetryResult::Success(()) => Disposition::Commit,
        RetryResult::Failed { .. } => Disposition::Retry,
        RetryResult::PermanentFailure { .. } => Disposition::Skip,
    }
}

pub struct RedpandaConsumer {
    brokers: String,
    group_id: String,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Per-subscription state of the receive loop
struct Subscription {
    consumer: StreamConsumer,
    channel_id: String,
    handler: Arc<dyn MessageHandler>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl RedpandaConsumer {
    pub fn new(brokers: &str, group_id: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            group_id: group_id.to_string(),
            retry: RetryConfig::default(),
            metrics: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    fn to_wire(message: &BorrowedMessage<'_>) -> EsResult<WireMessage> {
        let key = message
            .key_view::<str>()
            .transpose()
            .map_err(|e| EsError::Messaging(format!("key is not UTF-8: {}", e)))?
            .unwrap_or_default()
            .to_string();
        let payload = message
            .payload_view::<str>()
            .transpose()
            .map_err(|e| EsError::Messaging(format!("payload is not UTF-8: {}", e)))?
            .unwrap_or_default()
            .to_string();

        let mut headers = BTreeMap::new();
        if let Some(borrowed) = message.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }

        Ok(WireMessage {
            key,
            headers,
            payload,
        })
    }
}

impl Subscription {
    async fn run(self) {
        loop {
            let message = match self.consumer.recv().await {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(channel_id = %self.channel_id, error = %e, "Kafka receive error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match RedpandaConsumer::to_wire(&message) {
                Ok(wire) => self.handle_until_settled(&wire).await,
                Err(e) => self.skip(&e, None),
            }
            self.commit(&message);
        }
    }

    /// Returns once the message is handled or known to be unhandleable.
    async fn handle_until_settled(&self, wire: &WireMessage) {
        loop {
            let outcome = retry_on_transient(&self.retry, |_attempt| {
                let handler = self.handler.clone();
                let wire = wire.clone();
                async move { handler.handle(wire).await }
            })
            .await;

            match disposition(&outcome) {
                Disposition::Commit => return,
                Disposition::Skip => {
                    if let RetryResult::PermanentFailure { error, .. } = &outcome {
                        self.skip(error, Some(&wire.key));
                    }
                    return;
                }
                Disposition::Retry => {
                    if let RetryResult::Failed { error, attempts } = &outcome {
                        tracing::warn!(
                            channel_id = %self.channel_id,
                            key = %wire.key,
                            attempts = *attempts,
                            error = %error,
                            "Handler still failing, retrying the same message"
                        );
                    }
                    tokio::time::sleep(self.retry.max_delay).await;
                }
            }
        }
    }

    fn skip(&self, error: &EsError, key: Option<&str>) {
        tracing::error!(
            channel_id = %self.channel_id,
            key = key.unwrap_or_default(),
            error = %error,
            "Skipping message that cannot be handled"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_inbound_skipped(&self.channel_id);
        }
    }

    fn commit(&self, message: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            tracing::warn!(channel_id = %self.channel_id, error = %e, "Offset commit failed");
        }
    }
}

#[async_trait]
impl MessageConsumer for RedpandaConsumer {
    async fn subscribe(&self, channel_id: &str, handler: Arc<dyn MessageHandler>) -> EsResult<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| EsError::Messaging(format!("failed to create Redpanda consumer: {}", e)))?;

        consumer
            .subscribe(&[channel_id])
            .map_err(|e| EsError::Messaging(format!("failed to subscribe to {}: {}", channel_id, e)))?;

        tracing::info!(channel_id = %channel_id, group_id = %self.group_id, "Subscribed to Redpanda topic");

        let subscription = Subscription {
            consumer,
            channel_id: channel_id.to_string(),
            handler,
            retry: self.retry.clone(),
            metrics: self.metrics.clone(),
        };
        let task = tokio::spawn(subscription.run());
        self.tasks.lock().await.push(task);
        Ok(())
    }
}
