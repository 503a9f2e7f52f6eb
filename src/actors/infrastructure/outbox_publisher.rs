use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::{HealthMonitorActor, UpdateHealth};
use crate::actors::core::{ComponentHealth, HealthCheckable, HealthStatus};
use crate::error::EsResult;
use crate::outbox::{DrainReport, OutboxPublisher};

// ============================================================================
// Outbox Publisher Actor
// ============================================================================
//
// Owns the OutboxPublisher and serializes its drain rounds through the
// mailbox. A background ticker sends DrainOutbox every poll interval, and
// immediately whenever the aggregate managers signal a commit through the
// shared Notify. Published records are swept once per sweep interval.
//
// ============================================================================

const COMPONENT: &str = "outbox_publisher";

/// Run one drain round now.
#[derive(Debug, Clone, Copy)]
pub struct DrainOutbox;

#[derive(Debug, Clone, Copy)]
pub struct GetPublisherStats;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublisherStats {
    pub rounds: u64,
    pub published: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub skipped: u64,
    pub swept: u64,
    /// Rounds in a row that had at least one failure
    pub consecutive_failing_rounds: u32,
    pub last_error: Option<String>,
}

impl Reply for PublisherStats {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

pub struct OutboxPublisherActor {
    publisher: OutboxPublisher,
    notify: Option<Arc<Notify>>,
    health_monitor: Option<ActorRef<HealthMonitorActor>>,
    stats: PublisherStats,
    sweep_interval: Duration,
    last_sweep: Instant,
}

impl OutboxPublisherActor {
    pub fn new(publisher: OutboxPublisher) -> Self {
        let sweep_interval = publisher.config().retention.min(Duration::from_secs(60));
        Self {
            publisher,
            notify: None,
            health_monitor: None,
            stats: PublisherStats::default(),
            sweep_interval,
            last_sweep: Instant::now(),
        }
    }

    /// Drain as soon as `notify` fires, without waiting for the next tick
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn with_health_monitor(mut self, health_monitor: ActorRef<HealthMonitorActor>) -> Self {
        self.health_monitor = Some(health_monitor);
        self
    }

    fn record(&mut self, report: &DrainReport) {
        self.stats.rounds += 1;
        self.stats.published += report.published as u64;
        self.stats.failed += report.failed as u64;
        self.stats.dead_lettered += report.dead_lettered as u64;
        self.stats.skipped += report.skipped as u64;
        if report.failed + report.dead_lettered > 0 {
            self.stats.consecutive_failing_rounds += 1;
        } else {
            self.stats.consecutive_failing_rounds = 0;
            self.stats.last_error = None;
        }
    }

    async fn report_health(&self) {
        if let Some(monitor) = &self.health_monitor {
            let health = self.check_health();
            let _ = monitor
                .tell(UpdateHealth {
                    component: health.name,
                    status: health.status,
                    details: health.details,
                })
                .await;
        }
    }
}

impl HealthCheckable for OutboxPublisherActor {
    fn check_health(&self) -> ComponentHealth {
        let status = match self.stats.consecutive_failing_rounds {
            0 => HealthStatus::Healthy,
            1..=4 => HealthStatus::Degraded(format!(
                "{} failing rounds",
                self.stats.consecutive_failing_rounds
            )),
            n => HealthStatus::Unhealthy(format!("{} failing rounds", n)),
        };
        let health = ComponentHealth::new(COMPONENT, status);
        match &self.stats.last_error {
            Some(error) => health.with_details(error.clone()),
            None => health,
        }
    }

    fn component_name(&self) -> &str {
        COMPONENT
    }
}

impl Actor for OutboxPublisherActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!(
            poll_interval_ms = state.publisher.config().poll_interval.as_millis() as u64,
            batch_size = state.publisher.config().batch_size,
            push = state.notify.is_some(),
            "OutboxPublisherActor started"
        );

        let poll_interval = state.publisher.config().poll_interval;
        let notify = state.notify.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                match &notify {
                    Some(notify) => {
                        tokio::select! {
                            _ = interval.tick() => {}
                            _ = notify.notified() => {}
                        }
                    }
                    None => {
                        interval.tick().await;
                    }
                }

                // Stops once the actor is gone
                if actor_ref.tell(DrainOutbox).await.is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }
}

impl Message<DrainOutbox> for OutboxPublisherActor {
    type Reply = EsResult<DrainReport>;

    async fn handle(&mut self, _msg: DrainOutbox, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let report = match self.publisher.drain_once().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Outbox drain round failed");
                self.stats.consecutive_failing_rounds += 1;
                self.stats.last_error = Some(e.to_string());
                self.report_health().await;
                return Err(e);
            }
        };
        self.record(&report);

        if self.last_sweep.elapsed() >= self.sweep_interval {
            self.last_sweep = Instant::now();
            match self.publisher.sweep().await {
                Ok(swept) => self.stats.swept += swept,
                Err(e) => tracing::warn!(error = %e, "Outbox sweep failed"),
            }
        }

        self.report_health().await;
        Ok(report)
    }
}

impl Message<GetPublisherStats> for OutboxPublisherActor {
    type Reply = PublisherStats;

    async fn handle(
        &mut self,
        _msg: GetPublisherStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.stats.clone()
    }
}
