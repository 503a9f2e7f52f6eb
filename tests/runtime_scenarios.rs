// End-to-end scenarios against the in-memory backend and broker: command
// side, outbox, broker, idempotent consumer and query side wired together.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Barrier, Mutex};
use uuid::Uuid;

use es_runtime::consumer::{IdempotentConsumer, InboundEventHandler};
use es_runtime::domain::order::{
    self, execute_command, OrderAggregate, OrderCommand, OrderCommandHandler, OrderItem,
    OrderStatus, OrderSummaryProjection, ORDER_AGGREGATE_TYPE, ORDER_ORIGIN,
};
use es_runtime::event_sourcing::{
    AggregateFactory, AggregateManager, AggregateQueryService, AggregateRoot, CommandContext,
    DomainEvent, EventStore, InMemoryBackend, InMemoryTx, Registry, RegistryBuilder, SnapshotStore,
    TransactionManager,
};
use es_runtime::messaging::{
    InMemoryBroker, InMemoryChannelParticipant, JsonMessageMapper, MessageChannelParticipant,
    MessageConsumer, MessageProducer,
};
use es_runtime::outbox::{OutboxPublisher, OutboxPublisherConfig};
use es_runtime::{EsError, EsResult};

// ============================================================================
// Fixtures
// ============================================================================

struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl InboundEventHandler<InMemoryTx> for Counter {
    async fn apply(&self, tx: &mut InMemoryTx, _event: &DomainEvent) -> EsResult<()> {
        let applied = self.0.clone();
        tx.after_commit(move || {
            applied.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    }
}

fn registry(snapshot_every: Option<u32>) -> Arc<Registry> {
    Arc::new(
        order::register(RegistryBuilder::new(ORDER_ORIGIN), snapshot_every)
            .unwrap()
            .build(),
    )
}

fn items(quantities: &[i32]) -> Vec<OrderItem> {
    quantities
        .iter()
        .map(|&quantity| OrderItem {
            product_id: Uuid::new_v4(),
            quantity,
        })
        .collect()
}

fn create(order_id: &str) -> OrderCommand {
    OrderCommand::CreateOrder {
        order_id: order_id.to_string(),
        customer_id: Uuid::new_v4(),
        items: items(&[2, 1]),
    }
}

fn handler(registry: &Arc<Registry>, backend: &InMemoryBackend) -> OrderCommandHandler<InMemoryBackend> {
    OrderCommandHandler::new(
        AggregateManager::builder(registry.clone(), Arc::new(backend.clone()), backend.stores())
            .build()
            .unwrap(),
    )
}

fn handler_with_outbox(
    registry: &Arc<Registry>,
    backend: &InMemoryBackend,
    broker: &InMemoryBroker,
) -> OrderCommandHandler<InMemoryBackend> {
    OrderCommandHandler::new(
        AggregateManager::builder(registry.clone(), Arc::new(backend.clone()), backend.stores())
            .producer(Arc::new(broker.clone()))
            .outbound_mapper(Arc::new(JsonMessageMapper))
            .channel_participant(Arc::new(InMemoryChannelParticipant))
            .build()
            .unwrap(),
    )
}

fn publisher(backend: &InMemoryBackend, broker: &InMemoryBroker) -> OutboxPublisher {
    OutboxPublisher::new(
        Arc::new(backend.clone()),
        Arc::new(broker.clone()),
        OutboxPublisherConfig::default(),
    )
}

fn order_channel() -> String {
    InMemoryChannelParticipant.channel_id(ORDER_ORIGIN, ORDER_AGGREGATE_TYPE)
}

/// Subscribes an order-summary projection behind an idempotent consumer
async fn subscribe_projection(
    registry: &Arc<Registry>,
    backend: &InMemoryBackend,
    broker: &InMemoryBroker,
) -> OrderSummaryProjection {
    let projection = OrderSummaryProjection::new(registry.clone());
    let consumer = IdempotentConsumer::new(
        "order-summary",
        Arc::new(backend.clone()),
        backend.stores().consumed,
        Arc::new(projection.clone()),
        Arc::new(JsonMessageMapper),
    );
    broker
        .subscribe(&order_channel(), Arc::new(consumer))
        .await
        .unwrap();
    projection
}

async fn run(handler: &OrderCommandHandler<InMemoryBackend>, order_id: &str, commands: Vec<OrderCommand>) {
    for command in commands {
        handler
            .handle(order_id, CommandContext::new().with_tenant("acme"), command)
            .await
            .unwrap();
    }
}

fn full_lifecycle(order_id: &str) -> Vec<OrderCommand> {
    vec![
        create(order_id),
        OrderCommand::UpdateItems {
            items: items(&[5]),
            reason: Some("customer call".to_string()),
        },
        OrderCommand::ConfirmOrder,
        OrderCommand::ShipOrder {
            tracking_number: "TRACK-9".to_string(),
            carrier: "UPS".to_string(),
        },
        OrderCommand::DeliverOrder {
            signature: Some("J. Doe".to_string()),
        },
        OrderCommand::ArchiveOrder,
    ]
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn snapshot_at_any_point_plus_suffix_equals_full_replay() {
    // Policy present so the factory reads snapshots, never reached by commands
    let registry = registry(Some(1000));
    let backend = InMemoryBackend::new();
    run(&handler(&registry, &backend), "o-1", full_lifecycle("o-1")).await;
    assert!(backend.snapshot_sequence_numbers("o-1").await.is_empty());

    let factory = AggregateFactory::new(registry.clone(), &backend.stores());
    let mut tx = backend.begin().await.unwrap();
    let baseline = factory
        .build::<OrderAggregate>(&mut tx, "o-1", None)
        .await
        .unwrap()
        .unwrap();
    backend.rollback(tx).await.unwrap();
    assert_eq!(baseline.current_sequence_number(), 6);
    assert!(baseline.is_deleted());

    for k in 1..=6 {
        backend.delete_all_snapshots().await;

        let mut tx = backend.begin().await.unwrap();
        let at_k = factory
            .build::<OrderAggregate>(&mut tx, "o-1", Some(k))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_k.current_sequence_number(), k);
        backend
            .stores()
            .snapshots
            .save(&mut tx, &at_k.to_snapshot().unwrap())
            .await
            .unwrap();
        backend.commit(tx).await.unwrap();
        assert_eq!(backend.snapshot_sequence_numbers("o-1").await, vec![k]);

        let mut tx = backend.begin().await.unwrap();
        let from_snapshot = factory
            .build::<OrderAggregate>(&mut tx, "o-1", None)
            .await
            .unwrap()
            .unwrap();
        backend.rollback(tx).await.unwrap();

        assert_eq!(
            from_snapshot.to_snapshot().unwrap(),
            baseline.to_snapshot().unwrap(),
            "snapshot at {} plus suffix diverged from full replay",
            k
        );
    }
}

#[tokio::test]
async fn replaying_the_same_events_twice_yields_identical_state() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    run(&handler(&registry, &backend), "o-1", full_lifecycle("o-1")).await;
    let events = backend.committed_events("o-1").await;

    let replay = || {
        let mut root = AggregateRoot::<OrderAggregate>::new(registry.clone()).unwrap();
        for event in &events {
            root.apply_event(event).unwrap();
        }
        root
    };
    let first = replay();
    let second = replay();

    assert_eq!(first.state(), second.state());
    assert_eq!(first.to_snapshot().unwrap(), second.to_snapshot().unwrap());
    assert_eq!(first.state().item_count(), 5);
    assert_eq!(first.state().status, OrderStatus::Delivered);
}

// ============================================================================
// Optimistic concurrency
// ============================================================================

/// Holds every commit until two transactions are ready to commit
#[derive(Clone)]
struct GatedCommits {
    inner: InMemoryBackend,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl TransactionManager for GatedCommits {
    type Tx = InMemoryTx;

    async fn begin(&self) -> EsResult<InMemoryTx> {
        self.inner.begin().await
    }

    async fn commit(&self, tx: InMemoryTx) -> EsResult<()> {
        self.barrier.wait().await;
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: InMemoryTx) -> EsResult<()> {
        self.inner.rollback(tx).await
    }
}

#[tokio::test]
async fn concurrent_commands_from_same_state_commit_exactly_once() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    run(&handler(&registry, &backend), "o-1", vec![create("o-1")]).await;

    let gated = GatedCommits {
        inner: backend.clone(),
        barrier: Arc::new(Barrier::new(2)),
    };
    let manager = AggregateManager::<OrderAggregate, _>::builder(
        registry.clone(),
        Arc::new(gated),
        backend.stores(),
    )
    .build()
    .unwrap();

    let confirm = OrderCommand::ConfirmOrder;
    let update = OrderCommand::UpdateItems {
        items: items(&[4]),
        reason: None,
    };
    let (first, second) = tokio::join!(
        manager.execute("o-1", CommandContext::new(), |root| execute_command(root, &confirm)),
        manager.execute("o-1", CommandContext::new(), |root| execute_command(root, &update)),
    );

    let results = [first.map(|o| o.sequence_number), second.map(|o| o.sequence_number)];
    let winners = results.iter().filter(|r| matches!(r, Ok(2))).count();
    let losers = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(EsError::ConcurrentModification {
                    expected: 1,
                    actual: 2,
                    ..
                })
            )
        })
        .count();
    assert_eq!((winners, losers), (1, 1));
    assert_eq!(backend.committed_events("o-1").await.len(), 2);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(e) if e.is_concurrency_conflict())));
}

/// Lets another writer slip its events in right before the first commit
struct InterleavedWriter {
    inner: InMemoryBackend,
    intruder: Mutex<Option<Vec<DomainEvent>>>,
}

#[async_trait]
impl TransactionManager for InterleavedWriter {
    type Tx = InMemoryTx;

    async fn begin(&self) -> EsResult<InMemoryTx> {
        self.inner.begin().await
    }

    async fn commit(&self, tx: InMemoryTx) -> EsResult<()> {
        let intruder = self.intruder.lock().await.take();
        if let Some(events) = intruder {
            let mut other = self.inner.begin().await?;
            let head = events[0].sequence_number - 1;
            self.inner
                .append(&mut other, &events[0].aggregate_id, head, &events)
                .await?;
            self.inner.commit(other).await?;
        }
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: InMemoryTx) -> EsResult<()> {
        self.inner.rollback(tx).await
    }
}

#[tokio::test]
async fn conflicting_command_succeeds_after_rebuild() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    run(&handler(&registry, &backend), "o-1", vec![create("o-1")]).await;

    // Someone else's ItemsUpdated at seq 2
    let elsewhere = InMemoryBackend::new();
    run(
        &handler(&registry, &elsewhere),
        "o-1",
        vec![
            create("o-1"),
            OrderCommand::UpdateItems {
                items: items(&[9]),
                reason: None,
            },
        ],
    )
    .await;
    let intruder = elsewhere.committed_events("o-1").await.split_off(1);

    let manager = AggregateManager::<OrderAggregate, _>::builder(
        registry.clone(),
        Arc::new(InterleavedWriter {
            inner: backend.clone(),
            intruder: Mutex::new(Some(intruder)),
        }),
        backend.stores(),
    )
    .build()
    .unwrap();

    let outcome = manager
        .execute_with_retry("o-1", CommandContext::new(), |root| {
            execute_command(root, &OrderCommand::ConfirmOrder)
        })
        .await
        .unwrap();
    assert_eq!(outcome.sequence_number, 3);

    let types: Vec<String> = backend
        .committed_events("o-1")
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["OrderCreated", "OrderItemsUpdated", "OrderConfirmed"]);
}

// ============================================================================
// Corruption
// ============================================================================

#[tokio::test]
async fn gap_in_sequence_numbers_fails_replay() {
    let registry = registry(None);
    let source = InMemoryBackend::new();
    run(
        &handler(&registry, &source),
        "o-1",
        vec![
            create("o-1"),
            OrderCommand::ConfirmOrder,
            OrderCommand::ShipOrder {
                tracking_number: "T".to_string(),
                carrier: "DHL".to_string(),
            },
        ],
    )
    .await;

    // [1, 2, 4]
    let mut events = source.committed_events("o-1").await;
    events[2].sequence_number = 4;
    let backend = InMemoryBackend::new();
    backend.insert_raw_events(events).await;

    let factory = AggregateFactory::new(registry.clone(), &backend.stores());
    let mut tx = backend.begin().await.unwrap();
    let err = factory
        .build::<OrderAggregate>(&mut tx, "o-1", None)
        .await
        .unwrap_err();
    assert!(err.is_corruption());

    // Commands on the corrupted aggregate are refused and write nothing
    let err = handler(&registry, &backend)
        .handle(
            "o-1",
            CommandContext::new(),
            OrderCommand::DeliverOrder { signature: None },
        )
        .await
        .unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(backend.committed_events("o-1").await.len(), 3);
}

// ============================================================================
// Build scenario
// ============================================================================

#[tokio::test]
async fn build_returns_full_and_partial_state() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    run(
        &handler(&registry, &backend),
        "A1",
        vec![
            create("A1"),
            OrderCommand::UpdateItems {
                items: items(&[7]),
                reason: None,
            },
            OrderCommand::ConfirmOrder,
        ],
    )
    .await;

    let events = backend.committed_events("A1").await;
    assert_eq!(events[0].event_type, "OrderCreated");
    assert_eq!(
        events.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let queries = AggregateQueryService::new(registry.clone(), Arc::new(backend.clone()), &backend.stores());

    let mut expected = AggregateRoot::<OrderAggregate>::new(registry.clone()).unwrap();
    expected.apply_event(&events[0]).unwrap();
    expected.apply_event(&events[1]).unwrap();
    let at_two = queries
        .build::<OrderAggregate>("A1", Some(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_two.state(), expected.state());
    assert_eq!(at_two.state().status, OrderStatus::Created);
    assert_eq!(at_two.state().item_count(), 7);

    expected.apply_event(&events[2]).unwrap();
    let full = queries
        .build::<OrderAggregate>("A1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(full.state(), expected.state());
    assert_eq!(full.state().status, OrderStatus::Confirmed);
    assert_eq!(full.current_sequence_number(), 3);
}

// ============================================================================
// Outbox and inbound deduplication
// ============================================================================

#[tokio::test]
async fn event_and_outbox_record_commit_together_or_not_at_all() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    let broker = InMemoryBroker::new();
    let handler = handler_with_outbox(&registry, &backend, &broker);
    run(&handler, "o-1", vec![create("o-1")]).await;

    backend.fail_next_commits(1);
    let err = handler
        .handle("o-1", CommandContext::new(), OrderCommand::ConfirmOrder)
        .await
        .unwrap_err();
    assert!(matches!(err, EsError::Store(_)));

    assert_eq!(backend.committed_events("o-1").await.len(), 1);
    let records = backend.outbox_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0.event.sequence_number, 1);
    assert_eq!(records[0].0.channel_id, order_channel());
}

#[tokio::test]
async fn duplicate_delivery_has_one_side_effect() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    let broker = InMemoryBroker::new();
    let projection = subscribe_projection(&registry, &backend, &broker).await;
    let handler = handler_with_outbox(&registry, &backend, &broker);

    run(
        &handler,
        "o-1",
        vec![create("o-1"), OrderCommand::ConfirmOrder],
    )
    .await;
    let report = publisher(&backend, &broker).drain_once().await.unwrap();
    assert_eq!(report.published, 2);

    let summary = projection.summary("o-1").unwrap();
    assert_eq!(summary.status, "Confirmed");
    assert_eq!(summary.events_applied, 2);

    // The broker hands everything out again
    assert_eq!(broker.redeliver(&order_channel()).await.unwrap(), 2);
    assert_eq!(projection.summary("o-1").unwrap(), summary);
    assert_eq!(backend.consumed_count().await, 2);
}

#[tokio::test]
async fn crash_before_flagging_republishes_and_consumer_applies_once() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    let broker = InMemoryBroker::new();
    let projection = subscribe_projection(&registry, &backend, &broker).await;
    let handler = handler_with_outbox(&registry, &backend, &broker);

    run(&handler, "o-1", vec![create("o-1")]).await;
    publisher(&backend, &broker).drain_once().await.unwrap();

    // seq 2 and its outbox record commit together
    run(&handler, "o-1", vec![OrderCommand::ConfirmOrder]).await;
    let pending: Vec<_> = backend
        .outbox_records()
        .await
        .into_iter()
        .filter(|(_, published)| !published)
        .map(|(record, _)| record)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event.sequence_number, 2);

    // The first publisher gets the message out, then dies before flagging it
    broker
        .publish(&pending[0].channel_id, &pending[0].message)
        .await
        .unwrap();
    assert_eq!(projection.summary("o-1").unwrap().status, "Confirmed");

    // After restart a fresh publisher finds the record still unpublished
    let report = publisher(&backend, &broker).drain_once().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(broker.published(&order_channel()).await.len(), 3);

    let summary = projection.summary("o-1").unwrap();
    assert_eq!(summary.events_applied, 2);
    assert_eq!(backend.consumed_count().await, 2);
    assert!(backend
        .outbox_records()
        .await
        .iter()
        .all(|(_, published)| *published));

    // Nothing left for the next round
    assert!(publisher(&backend, &broker).drain_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn same_event_is_applied_once_per_tenant() {
    let registry = registry(None);
    let backend = InMemoryBackend::new();
    let applied = Arc::new(AtomicUsize::new(0));

    let source = InMemoryBackend::new();
    run(&handler(&registry, &source), "o-1", vec![create("o-1")]).await;
    let event = source.committed_events("o-1").await.remove(0);
    let mut other_tenant = event.clone();
    other_tenant.tenant_id = Some("globex".to_string());

    let consumer = IdempotentConsumer::new(
        "billing",
        Arc::new(backend.clone()),
        backend.stores().consumed,
        Arc::new(Counter(applied.clone())),
        Arc::new(JsonMessageMapper),
    );
    for delivery in [&event, &event, &other_tenant, &other_tenant] {
        consumer.consume(delivery).await.unwrap();
    }
    assert_eq!(applied.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Configuration errors
// ============================================================================

#[test]
fn registering_orders_twice_is_rejected() {
    let builder = order::register(RegistryBuilder::new(ORDER_ORIGIN), None).unwrap();
    let err = order::register(builder, None).unwrap_err();
    assert!(matches!(err, EsError::AlreadyRegistered(_)));
}

#[test]
fn producer_without_mapper_is_rejected_at_construction() {
    let backend = InMemoryBackend::new();
    let err = AggregateManager::<OrderAggregate, _>::builder(
        registry(None),
        Arc::new(backend.clone()),
        backend.stores(),
    )
    .producer(Arc::new(InMemoryBroker::new()))
    .build()
    .err()
    .unwrap();
    assert!(matches!(err, EsError::IncompleteMessagingConfiguration(_)));
}
