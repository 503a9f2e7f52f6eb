use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use es_runtime::actors::{CheckHealth, CoordinatorActor, CoordinatorSetup, DrainNow, Shutdown};
use es_runtime::config::RuntimeConfig;
use es_runtime::consumer::{IdempotentConsumer, InboundEventHandler};
use es_runtime::domain::order::{
    self, OrderAggregate, OrderCommand, OrderCommandHandler, OrderItem, OrderSummaryProjection,
    ORDER_AGGREGATE_TYPE, ORDER_ORIGIN,
};
use es_runtime::event_sourcing::core::registry;
use es_runtime::event_sourcing::{
    AggregateManager, AggregateQueryService, CommandContext, DeadLetterStore, InMemoryBackend,
    OutboxDrain, PgBackend, Registry, RegistryBuilder, StoreSet, TransactionManager,
};
use es_runtime::messaging::{
    InMemoryBroker, InMemoryChannelParticipant, JsonMessageMapper, KafkaChannelParticipant,
    MessageChannelParticipant, MessageConsumer, MessageProducer, RedpandaClient, RedpandaConsumer,
};
use es_runtime::metrics::{self, Metrics};

const SNAPSHOT_EVERY: u32 = 10;

/// What both backends share
struct Wiring {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    producer: Arc<dyn MessageProducer>,
    consumer: Arc<dyn MessageConsumer>,
    participant: Arc<dyn MessageChannelParticipant>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,es_runtime=debug")),
        )
        .init();

    tracing::info!("Starting event sourcing runtime");

    let config = RuntimeConfig::from_env()?;
    tracing::info!(
        postgres = config.database_url.is_some(),
        kafka = config.kafka_brokers.is_some(),
        "Configuration loaded"
    );

    // === 1. Registries, installed once before any command runs ===
    let registry = registry::install(
        order::register(RegistryBuilder::new(ORDER_ORIGIN), Some(SNAPSHOT_EVERY))?.build(),
    )?;

    // === 2. Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!(
        metrics = metrics.registry().gather().len(),
        "Metrics registry created"
    );

    // Metrics HTTP server runs on its own runtime (actix-web)
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }),
        Err(e) => tracing::error!("Could not start metrics runtime: {}", e),
    });

    // === 3. Broker ===
    let (producer, consumer, participant): (
        Arc<dyn MessageProducer>,
        Arc<dyn MessageConsumer>,
        Arc<dyn MessageChannelParticipant>,
    ) = match &config.kafka_brokers {
        Some(brokers) => (
            Arc::new(RedpandaClient::new(brokers)?.with_metrics(metrics.clone())),
            Arc::new(
                RedpandaConsumer::new(brokers, &config.kafka_consumer_group)
                    .with_metrics(metrics.clone()),
            ),
            Arc::new(KafkaChannelParticipant::new()),
        ),
        None => {
            let broker = InMemoryBroker::new();
            (
                Arc::new(broker.clone()),
                Arc::new(broker),
                Arc::new(InMemoryChannelParticipant),
            )
        }
    };

    let projection = Arc::new(OrderSummaryProjection::new(registry.clone()));
    let wiring = Wiring {
        config,
        registry,
        metrics,
        producer,
        consumer,
        participant,
    };

    // === 4. Event store backend ===
    match wiring.config.database_url.clone() {
        Some(url) => {
            let backend =
                PgBackend::connect(&url, wiring.config.database_max_connections).await?;
            backend.bootstrap_schema().await?;
            let stores = backend.stores();
            let shared = Arc::new(backend);
            run(wiring, shared.clone(), stores, shared.clone(), shared, projection).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, events are kept in memory only");
            let backend = InMemoryBackend::new();
            let stores = backend.stores();
            let shared = Arc::new(backend);
            run(wiring, shared.clone(), stores, shared.clone(), shared, projection).await
        }
    }
}

async fn run<T>(
    wiring: Wiring,
    transactions: Arc<T>,
    stores: StoreSet<T::Tx>,
    drain: Arc<dyn OutboxDrain>,
    dead_letters: Arc<dyn DeadLetterStore>,
    projection: Arc<OrderSummaryProjection>,
) -> anyhow::Result<()>
where
    T: TransactionManager,
    OrderSummaryProjection: InboundEventHandler<T::Tx>,
{
    let Wiring {
        config,
        registry,
        metrics,
        producer,
        consumer,
        participant,
    } = wiring;

    // === 5. Coordinator (outbox publisher, DLQ, health monitor) ===
    let outbox_notify = Arc::new(Notify::new());
    let coordinator = CoordinatorActor::spawn(CoordinatorSetup {
        drain,
        dead_letters,
        producer: producer.clone(),
        publisher_config: config.publisher_config(),
        outbox_notify: Some(outbox_notify.clone()),
        metrics: Some(metrics.clone()),
        health_check_interval: Duration::from_secs(10),
    });

    // === 6. Inbound side: order summaries, exactly once per event ===
    let channel_id = participant.channel_id(ORDER_ORIGIN, ORDER_AGGREGATE_TYPE);
    let summaries = IdempotentConsumer::new(
        "order-summary",
        transactions.clone(),
        stores.consumed.clone(),
        projection.clone(),
        Arc::new(JsonMessageMapper),
    )
    .with_metrics(metrics.clone());
    consumer.subscribe(&channel_id, Arc::new(summaries)).await?;
    tracing::info!(channel_id = %channel_id, "Order summary projection subscribed");

    // === 7. Command side ===
    let manager = AggregateManager::<OrderAggregate, T>::builder(
        registry.clone(),
        transactions.clone(),
        stores.clone(),
    )
    .producer(producer)
    .outbound_mapper(Arc::new(JsonMessageMapper))
    .channel_participant(participant)
    .timeout(config.transaction_timeout)
    .metrics(metrics.clone())
    .outbox_notify(outbox_notify)
    .build()?;
    let orders = OrderCommandHandler::new(manager);

    // === 8. Demo: one order through its lifecycle ===
    let order_id = Uuid::now_v7().to_string();
    let context = CommandContext::new()
        .with_tenant("demo")
        .with_correlation(&Uuid::now_v7().to_string());

    let commands = vec![
        OrderCommand::CreateOrder {
            order_id: order_id.clone(),
            customer_id: Uuid::new_v4(),
            items: vec![
                OrderItem {
                    product_id: Uuid::new_v4(),
                    quantity: 2,
                },
                OrderItem {
                    product_id: Uuid::new_v4(),
                    quantity: 1,
                },
            ],
        },
        OrderCommand::ConfirmOrder,
        OrderCommand::ShipOrder {
            tracking_number: "TRACK-123".to_string(),
            carrier: "DHL".to_string(),
        },
    ];

    for command in commands {
        let name = command.name();
        let outcome = orders.handle(&order_id, context.clone(), command).await?;
        tracing::info!(
            order_id = %order_id,
            command = name,
            sequence_number = outcome.sequence_number,
            snapshot_taken = outcome.snapshot_taken,
            "Command committed"
        );
    }

    let report = coordinator
        .ask(DrainNow)
        .await
        .map_err(|e| anyhow::anyhow!("outbox drain failed: {}", e))?;
    tracing::info!(
        published = report.published,
        failed = report.failed,
        "Outbox drained"
    );

    // === 9. Query side: state as of the confirmation ===
    let queries = AggregateQueryService::new(registry, transactions, &stores);
    if let Some(confirmed) = queries.build::<OrderAggregate>(&order_id, Some(2)).await? {
        tracing::info!(
            order_id = %order_id,
            sequence_number = confirmed.current_sequence_number(),
            status = confirmed.state().status.as_str(),
            "Order as of sequence number 2"
        );
    }
    if let Some(summary) = projection.summary(&order_id) {
        tracing::info!(
            order_id = %summary.order_id,
            status = %summary.status,
            item_count = summary.item_count,
            "Order summary projected"
        );
    }

    let health = coordinator
        .ask(CheckHealth)
        .await
        .map_err(|e| anyhow::anyhow!("health check failed: {}", e))?;
    tracing::info!(status = ?health.overall_status, "System health");

    tracing::info!("Runtime running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    if let Err(e) = coordinator.ask(Shutdown).await {
        tracing::warn!("Coordinator did not stop its children: {}", e);
    }
    if let Err(e) = coordinator.stop_gracefully().await {
        tracing::warn!("Coordinator stop failed: {}", e);
    }

    Ok(())
}
