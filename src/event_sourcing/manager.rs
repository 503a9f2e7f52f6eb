use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::core::{
    Aggregate, AggregateMetadata, AggregateRoot, CommandContext, DomainEvent, Registry,
};
use super::factory::AggregateFactory;
use super::store::{StoreSet, TransactionManager};
use crate::error::{EsError, EsResult};
use crate::messaging::{MessageChannelParticipant, MessageProducer, OutboundMessageMapper};
use crate::metrics::Metrics;
use crate::outbox::OutboxRecord;
use crate::utils::{retry_on_transient, IsTransient, RetryConfig};

// ============================================================================
// Aggregate Manager - one command, one transaction
// ============================================================================
//
// 1. begin
// 2. rehydrate through the factory, inside the transaction
// 3. run the command closure, which stages events
// 4. append with the head seen in 2 as the expected head
// 5. snapshot if the policy's boundary was crossed
// 6. one outbox record per staged event (if messaging is configured)
// 7. commit
//
// Any failure rolls the whole transaction back. The unit of work runs under
// a timeout; hitting it drops the transaction, which is a rollback.
//
// ============================================================================

/// What a committed command produced.
#[derive(Debug)]
pub struct CommandOutcome<R> {
    pub aggregate_id: String,
    pub result: R,
    pub events: Vec<DomainEvent>,
    pub sequence_number: i64,
    pub snapshot_taken: bool,
}

/// Outbox records are published by the coordinator's publisher. The
/// manager only needs the producer to be configured at all.
struct OutboxRouting {
    mapper: Arc<dyn OutboundMessageMapper>,
    participant: Arc<dyn MessageChannelParticipant>,
}

pub struct AggregateManager<A: Aggregate, T: TransactionManager> {
    registry: Arc<Registry>,
    metadata: AggregateMetadata,
    transactions: Arc<T>,
    stores: StoreSet<T::Tx>,
    factory: AggregateFactory<T::Tx>,
    routing: Option<OutboxRouting>,
    timeout: Duration,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
    outbox_notify: Option<Arc<Notify>>,
    _aggregate: PhantomData<fn() -> A>,
}

pub struct AggregateManagerBuilder<A: Aggregate, T: TransactionManager> {
    registry: Arc<Registry>,
    transactions: Arc<T>,
    stores: StoreSet<T::Tx>,
    producer: Option<Arc<dyn MessageProducer>>,
    mapper: Option<Arc<dyn OutboundMessageMapper>>,
    participant: Option<Arc<dyn MessageChannelParticipant>>,
    timeout: Duration,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
    outbox_notify: Option<Arc<Notify>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate, T: TransactionManager> AggregateManagerBuilder<A, T> {
    pub fn producer(mut self, producer: Arc<dyn MessageProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn outbound_mapper(mut self, mapper: Arc<dyn OutboundMessageMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn channel_participant(mut self, participant: Arc<dyn MessageChannelParticipant>) -> Self {
        self.participant = Some(participant);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wake the outbox publisher after every commit that wrote outbox records.
    pub fn outbox_notify(mut self, notify: Arc<Notify>) -> Self {
        self.outbox_notify = Some(notify);
        self
    }

    pub fn build(self) -> EsResult<AggregateManager<A, T>> {
        let metadata = self.registry.lookup::<A>()?.clone();
        if !self.registry.is_local(&metadata) {
            return Err(EsError::ForeignAggregate {
                origin: metadata.origin,
                aggregate_type: metadata.aggregate_type,
                local_origin: self.registry.local_origin().to_string(),
            });
        }

        let routing = match (self.producer, self.mapper) {
            (Some(_), Some(mapper)) => Some(OutboxRouting {
                mapper,
                participant: self
                    .participant
                    .unwrap_or_else(|| Arc::new(crate::messaging::InMemoryChannelParticipant)),
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(EsError::IncompleteMessagingConfiguration(
                    "a message producer is configured without an outbound mapper",
                ))
            }
            (None, Some(_)) => {
                return Err(EsError::IncompleteMessagingConfiguration(
                    "an outbound mapper is configured without a message producer",
                ))
            }
        };

        tracing::info!(
            origin = %metadata.origin,
            aggregate_type = %metadata.aggregate_type,
            outbox = routing.is_some(),
            snapshot_policy = ?metadata.snapshot_policy,
            "Aggregate manager ready"
        );

        Ok(AggregateManager {
            factory: AggregateFactory::new(self.registry.clone(), &self.stores),
            registry: self.registry,
            metadata,
            transactions: self.transactions,
            stores: self.stores,
            routing,
            timeout: self.timeout,
            retry: self.retry,
            metrics: self.metrics,
            outbox_notify: self.outbox_notify,
            _aggregate: PhantomData,
        })
    }
}

/// Only optimistic-concurrency conflicts are worth re-running a command for.
struct Conflict(EsError);

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl IsTransient for Conflict {
    fn is_transient(&self) -> bool {
        self.0.is_concurrency_conflict()
    }
}

impl<A: Aggregate, T: TransactionManager> AggregateManager<A, T> {
    pub fn builder(
        registry: Arc<Registry>,
        transactions: Arc<T>,
        stores: StoreSet<T::Tx>,
    ) -> AggregateManagerBuilder<A, T> {
        AggregateManagerBuilder {
            registry,
            transactions,
            stores,
            producer: None,
            mapper: None,
            participant: None,
            timeout: Duration::from_secs(5),
            retry: RetryConfig::for_conflicts(),
            metrics: None,
            outbox_notify: None,
            _aggregate: PhantomData,
        }
    }

    pub fn metadata(&self) -> &AggregateMetadata {
        &self.metadata
    }

    /// Run a creation command against a fresh root. The command must set the
    /// identity and stage at least the creation event.
    pub async fn create<R, F>(&self, context: CommandContext, command: F) -> EsResult<CommandOutcome<R>>
    where
        F: FnOnce(&mut AggregateRoot<A>) -> EsResult<R> + Send,
        R: Send,
    {
        self.run(None, context, command).await
    }

    /// Run a command against an existing aggregate.
    pub async fn execute<R, F>(
        &self,
        aggregate_id: &str,
        context: CommandContext,
        command: F,
    ) -> EsResult<CommandOutcome<R>>
    where
        F: FnOnce(&mut AggregateRoot<A>) -> EsResult<R> + Send,
        R: Send,
    {
        self.run(Some(aggregate_id), context, command).await
    }

    /// Like `execute`, but on ConcurrentModification rebuild and run the
    /// command again, with backoff.
    pub async fn execute_with_retry<R, F>(
        &self,
        aggregate_id: &str,
        context: CommandContext,
        command: F,
    ) -> EsResult<CommandOutcome<R>>
    where
        F: Fn(&mut AggregateRoot<A>) -> EsResult<R> + Send + Sync,
        R: Send,
    {
        let command = &command;
        retry_on_transient(&self.retry, |attempt| {
            let context = context.clone();
            async move {
                if attempt > 1 {
                    tracing::debug!(
                        aggregate_id = %aggregate_id,
                        attempt = attempt,
                        "Re-running command after concurrent modification"
                    );
                }
                self.execute(aggregate_id, context, command)
                    .await
                    .map_err(Conflict)
            }
        })
        .await
        .into_result()
        .map_err(|conflict| conflict.0)
    }

    async fn run<R, F>(
        &self,
        aggregate_id: Option<&str>,
        context: CommandContext,
        command: F,
    ) -> EsResult<CommandOutcome<R>>
    where
        F: FnOnce(&mut AggregateRoot<A>) -> EsResult<R> + Send,
        R: Send,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            self.unit_of_work(aggregate_id, context, command),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    aggregate_id = ?aggregate_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Unit of work timed out, transaction rolled back"
                );
                Err(EsError::TransactionTimeout(self.timeout))
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_command(&self.metadata.aggregate_type, started.elapsed().as_secs_f64());
            match &result {
                Ok(outcome) => {
                    metrics.record_events_appended(&self.metadata.aggregate_type, outcome.events.len());
                    if outcome.snapshot_taken {
                        metrics.record_snapshot(&self.metadata.aggregate_type);
                    }
                }
                Err(e) if e.is_concurrency_conflict() => {
                    metrics.record_concurrency_conflict(&self.metadata.aggregate_type)
                }
                Err(_) => {}
            }
        }
        result
    }

    async fn unit_of_work<R, F>(
        &self,
        aggregate_id: Option<&str>,
        context: CommandContext,
        command: F,
    ) -> EsResult<CommandOutcome<R>>
    where
        F: FnOnce(&mut AggregateRoot<A>) -> EsResult<R> + Send,
        R: Send,
    {
        let mut tx = self.transactions.begin().await?;

        match self.stage_and_write(&mut tx, aggregate_id, context, command).await {
            Ok(outcome) => {
                self.transactions.commit(tx).await?;

                tracing::info!(
                    aggregate_id = %outcome.aggregate_id,
                    sequence_number = outcome.sequence_number,
                    event_count = outcome.events.len(),
                    snapshot = outcome.snapshot_taken,
                    "Committed command"
                );

                if self.routing.is_some() && !outcome.events.is_empty() {
                    if let Some(notify) = &self.outbox_notify {
                        notify.notify_one();
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_error) = self.transactions.rollback(tx).await {
                    tracing::warn!(error = %rollback_error, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn stage_and_write<R, F>(
        &self,
        tx: &mut T::Tx,
        aggregate_id: Option<&str>,
        context: CommandContext,
        command: F,
    ) -> EsResult<CommandOutcome<R>>
    where
        F: FnOnce(&mut AggregateRoot<A>) -> EsResult<R> + Send,
        R: Send,
    {
        let mut root = match aggregate_id {
            Some(id) => self
                .factory
                .build::<A>(tx, id, None)
                .await?
                .ok_or_else(|| EsError::AggregateNotFound(id.to_string()))?,
            None => AggregateRoot::new(self.registry.clone())?,
        };
        let previous_head = root.current_sequence_number();

        root.begin_command(context)?;
        let result = command(&mut root);
        let staged = root.end_command();
        let result = result?;

        let target_id = match (aggregate_id, staged.first()) {
            (Some(id), _) => id.to_string(),
            (None, Some(first)) => first.aggregate_id.clone(),
            (None, None) => {
                return Err(EsError::CommandRejected(format!(
                    "creation command for {} staged no events",
                    self.metadata.aggregate_type
                )))
            }
        };

        if staged.is_empty() {
            return Ok(CommandOutcome {
                aggregate_id: target_id,
                result,
                events: staged,
                sequence_number: previous_head,
                snapshot_taken: false,
            });
        }

        if aggregate_id.is_none() && self.stores.events.head(tx, &target_id).await? > 0 {
            return Err(EsError::CommandRejected(format!(
                "{} {} already exists",
                self.metadata.aggregate_type, target_id
            )));
        }

        self.stores
            .events
            .append(tx, &target_id, previous_head, &staged)
            .await?;

        let sequence_number = root.current_sequence_number();
        let snapshot_taken = match &self.metadata.snapshot_policy {
            Some(policy) if policy.should_snapshot(previous_head, sequence_number) => {
                self.stores.snapshots.save(tx, &root.to_snapshot()?).await?;
                tracing::debug!(
                    aggregate_id = %target_id,
                    sequence_number = sequence_number,
                    "Wrote snapshot"
                );
                true
            }
            _ => false,
        };

        if let Some(routing) = &self.routing {
            let records = staged
                .iter()
                .map(|event| {
                    Ok(OutboxRecord {
                        channel_id: routing
                            .participant
                            .channel_id(&event.origin, &event.aggregate_type),
                        message: routing.mapper.to_message(event)?,
                        event: event.clone(),
                    })
                })
                .collect::<EsResult<Vec<_>>>()?;
            self.stores.outbox.append(tx, &records).await?;
            tracing::debug!(
                aggregate_id = %target_id,
                channel_id = %records[0].channel_id,
                records = records.len(),
                "Wrote outbox records"
            );
        }

        Ok(CommandOutcome {
            aggregate_id: target_id,
            result,
            events: staged,
            sequence_number,
            snapshot_taken,
        })
    }
}
