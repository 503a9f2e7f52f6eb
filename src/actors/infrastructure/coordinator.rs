use kameo::actor::ActorRef;
use kameo::error::{Infallible, SendError};
use kameo::message::{Context, Message};
use kameo::Actor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{
    DlqActor, DrainOutbox, GetSystemHealth, HealthMonitorActor, OutboxPublisherActor, SystemHealth,
    UpdateHealth,
};
use crate::actors::core::HealthStatus;
use crate::error::{EsError, EsResult};
use crate::event_sourcing::store::{DeadLetterStore, OutboxDrain};
use crate::messaging::MessageProducer;
use crate::metrics::Metrics;
use crate::outbox::{DrainReport, OutboxPublisher, OutboxPublisherConfig};

// ============================================================================
// Coordinator Actor - Orchestrates all system actors
// ============================================================================
//
// Responsibilities:
// - Starts and owns the infrastructure actors
// - Logs system health periodically
// - Coordinates graceful shutdown
//
// Actor Hierarchy:
//   CoordinatorActor
//   ├── HealthMonitorActor
//   ├── DlqActor
//   └── OutboxPublisherActor
//
// ============================================================================

/// Everything the coordinator needs to start its children
pub struct CoordinatorSetup {
    pub drain: Arc<dyn OutboxDrain>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub producer: Arc<dyn MessageProducer>,
    pub publisher_config: OutboxPublisherConfig,
    pub outbox_notify: Option<Arc<Notify>>,
    pub metrics: Option<Arc<Metrics>>,
    pub health_check_interval: Duration,
}

pub struct CoordinatorActor {
    health_monitor: ActorRef<HealthMonitorActor>,
    dlq_actor: ActorRef<DlqActor>,
    outbox_publisher: ActorRef<OutboxPublisherActor>,
}

impl CoordinatorActor {
    async fn start_child_actors(setup: CoordinatorSetup) -> Self {
        tracing::info!("Starting child actors");

        let health_monitor = HealthMonitorActor::spawn(
            HealthMonitorActor::new().watching(setup.producer.clone(), setup.health_check_interval),
        );

        let mut dlq = DlqActor::new(setup.dead_letters);
        if let Some(metrics) = &setup.metrics {
            dlq = dlq.with_metrics(metrics.clone());
        }
        let dlq_actor = DlqActor::spawn(dlq);

        let _ = health_monitor
            .tell(UpdateHealth {
                component: "dlq_actor".to_string(),
                status: HealthStatus::Healthy,
                details: Some("DLQ actor started".to_string()),
            })
            .await;

        let mut publisher = OutboxPublisher::new(setup.drain, setup.producer, setup.publisher_config)
            .with_dlq(dlq_actor.clone());
        if let Some(metrics) = setup.metrics {
            publisher = publisher.with_metrics(metrics);
        }
        let mut publisher_actor =
            OutboxPublisherActor::new(publisher).with_health_monitor(health_monitor.clone());
        if let Some(notify) = setup.outbox_notify {
            publisher_actor = publisher_actor.with_notify(notify);
        }
        let outbox_publisher = OutboxPublisherActor::spawn(publisher_actor);

        tracing::info!("All child actors started");

        Self {
            health_monitor,
            dlq_actor,
            outbox_publisher,
        }
    }
}

impl Actor for CoordinatorActor {
    type Args = CoordinatorSetup;
    type Error = Infallible;

    async fn on_start(setup: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!("CoordinatorActor started");
        let interval = setup.health_check_interval * 3;
        let state = Self::start_child_actors(setup).await;

        // Periodic health log
        let health_monitor = state.health_monitor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match health_monitor.ask(GetSystemHealth).await {
                    Ok(health) => match health.overall_status {
                        HealthStatus::Healthy => {
                            tracing::debug!("System health check: Healthy");
                        }
                        HealthStatus::Degraded(ref msg) => {
                            tracing::warn!("System health check: Degraded - {}", msg);
                        }
                        HealthStatus::Unhealthy(ref msg) => {
                            tracing::error!("System health check: Unhealthy - {}", msg);
                        }
                    },
                    Err(_) => break,
                }
            }
        });

        Ok(state)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Stop every child actor. The coordinator itself is stopped by its owner.
#[derive(Debug, Clone, Copy)]
pub struct Shutdown;

/// Forwarded to the outbox publisher
#[derive(Debug, Clone, Copy)]
pub struct DrainNow;

#[derive(Debug, Clone, Copy)]
pub struct CheckHealth;

impl Message<Shutdown> for CoordinatorActor {
    type Reply = ();

    async fn handle(&mut self, _msg: Shutdown, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        tracing::info!("Received shutdown signal, stopping child actors");

        // Publisher first so nothing new reaches the DLQ
        let _ = self.outbox_publisher.stop_gracefully().await;
        let _ = self.dlq_actor.stop_gracefully().await;
        let _ = self.health_monitor.stop_gracefully().await;
    }
}

impl Message<DrainNow> for CoordinatorActor {
    type Reply = EsResult<DrainReport>;

    async fn handle(&mut self, _msg: DrainNow, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match self.outbox_publisher.ask(DrainOutbox).await {
            Ok(report) => Ok(report),
            Err(SendError::HandlerError(e)) => Err(e),
            Err(e) => Err(EsError::Messaging(format!("outbox publisher unavailable: {e}"))),
        }
    }
}

impl Message<CheckHealth> for CoordinatorActor {
    type Reply = EsResult<SystemHealth>;

    async fn handle(&mut self, _msg: CheckHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.health_monitor
            .ask(GetSystemHealth)
            .await
            .map_err(|e| EsError::Messaging(format!("health monitor unavailable: {e}")))
    }
}
