// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// - command path: events appended, concurrency conflicts, latency, snapshots
// - outbox: published, failed, publish latency, swept
// - dead letter queue
// - inbound consumers: applied vs. discarded duplicates, skipped messages
// - broker circuit breaker state
//
// All metrics are registered with one Prometheus registry, scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Command path
    pub events_appended: IntCounterVec,
    pub concurrency_conflicts: IntCounterVec,
    pub command_duration: HistogramVec,
    pub snapshots_written: IntCounterVec,

    // Outbox
    pub outbox_published: IntCounterVec,
    pub outbox_publish_failed: IntCounterVec,
    pub outbox_publish_duration: HistogramVec,
    pub outbox_swept: IntCounter,

    // DLQ
    pub dlq_messages_total: IntCounter,
    pub dlq_messages_by_event_type: IntCounterVec,

    // Inbound
    pub inbound_applied: IntCounterVec,
    pub inbound_duplicates: IntCounterVec,
    pub inbound_skipped: IntCounterVec,

    // Circuit Breaker
    pub circuit_breaker_state: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_appended = IntCounterVec::new(
            Opts::new("es_events_appended_total", "Domain events appended to the log"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let concurrency_conflicts = IntCounterVec::new(
            Opts::new(
                "es_concurrency_conflicts_total",
                "Units of work that lost the optimistic concurrency check",
            ),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(concurrency_conflicts.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new("es_command_duration_seconds", "Unit of work duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let snapshots_written = IntCounterVec::new(
            Opts::new("es_snapshots_written_total", "Snapshots written by the manager"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(snapshots_written.clone()))?;

        let outbox_published = IntCounterVec::new(
            Opts::new("outbox_published_total", "Outbox records accepted by the broker"),
            &["channel"],
        )?;
        registry.register(Box::new(outbox_published.clone()))?;

        let outbox_publish_failed = IntCounterVec::new(
            Opts::new("outbox_publish_failed_total", "Failed outbox publish rounds"),
            &["channel", "reason"],
        )?;
        registry.register(Box::new(outbox_publish_failed.clone()))?;

        let outbox_publish_duration = HistogramVec::new(
            HistogramOpts::new("outbox_publish_duration_seconds", "Outbox publish duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["channel"],
        )?;
        registry.register(Box::new(outbox_publish_duration.clone()))?;

        let outbox_swept = IntCounter::new(
            "outbox_swept_total",
            "Published outbox records deleted after retention",
        )?;
        registry.register(Box::new(outbox_swept.clone()))?;

        let dlq_messages_total = IntCounter::new(
            "dlq_messages_total",
            "Total messages in dead letter queue",
        )?;
        registry.register(Box::new(dlq_messages_total.clone()))?;

        let dlq_messages_by_event_type = IntCounterVec::new(
            Opts::new("dlq_messages_by_event_type", "DLQ messages by event type"),
            &["event_type"],
        )?;
        registry.register(Box::new(dlq_messages_by_event_type.clone()))?;

        let inbound_applied = IntCounterVec::new(
            Opts::new("inbound_applied_total", "Inbound events applied by a consumer"),
            &["consumer"],
        )?;
        registry.register(Box::new(inbound_applied.clone()))?;

        let inbound_duplicates = IntCounterVec::new(
            Opts::new(
                "inbound_duplicates_total",
                "Inbound events discarded as already consumed",
            ),
            &["consumer"],
        )?;
        registry.register(Box::new(inbound_duplicates.clone()))?;

        let inbound_skipped = IntCounterVec::new(
            Opts::new(
                "inbound_skipped_total",
                "Inbound messages committed without being applied (unreadable or rejected)",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(inbound_skipped.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            events_appended,
            concurrency_conflicts,
            command_duration,
            snapshots_written,
            outbox_published,
            outbox_publish_failed,
            outbox_publish_duration,
            outbox_swept,
            dlq_messages_total,
            dlq_messages_by_event_type,
            inbound_applied,
            inbound_duplicates,
            inbound_skipped,
            circuit_breaker_state,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_command(&self, aggregate_type: &str, duration_secs: f64) {
        self.command_duration
            .with_label_values(&[aggregate_type])
            .observe(duration_secs);
    }

    pub fn record_events_appended(&self, aggregate_type: &str, count: usize) {
        self.events_appended
            .with_label_values(&[aggregate_type])
            .inc_by(count as u64);
    }

    pub fn record_concurrency_conflict(&self, aggregate_type: &str) {
        self.concurrency_conflicts
            .with_label_values(&[aggregate_type])
            .inc();
    }

    pub fn record_snapshot(&self, aggregate_type: &str) {
        self.snapshots_written.with_label_values(&[aggregate_type]).inc();
    }

    /// Helper to record one outbox publish round
    pub fn record_publish(&self, channel: &str, duration_secs: f64, success: bool) {
        if success {
            self.outbox_published.with_label_values(&[channel]).inc();
        } else {
            self.outbox_publish_failed
                .with_label_values(&[channel, "broker_error"])
                .inc();
        }
        self.outbox_publish_duration
            .with_label_values(&[channel])
            .observe(duration_secs);
    }

    pub fn record_swept(&self, count: u64) {
        self.outbox_swept.inc_by(count);
    }

    /// Helper to record DLQ message
    pub fn record_dlq_message(&self, event_type: &str) {
        self.dlq_messages_total.inc();
        self.dlq_messages_by_event_type.with_label_values(&[event_type]).inc();
    }

    pub fn record_inbound(&self, consumer: &str, duplicate: bool) {
        if duplicate {
            self.inbound_duplicates.with_label_values(&[consumer]).inc();
        } else {
            self.inbound_applied.with_label_values(&[consumer]).inc();
        }
    }

    pub fn record_inbound_skipped(&self, channel: &str) {
        self.inbound_skipped.with_label_values(&[channel]).inc();
    }

    /// Helper to update circuit breaker state
    pub fn update_circuit_breaker_state(&self, state: i64) {
        self.circuit_breaker_state.set(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> f64 {
        let gathered = metrics.registry().gather();
        let family = gathered.iter().find(|m| m.name() == name).unwrap();
        family
            .metric
            .iter()
            .map(|m| m.counter.value.unwrap_or_default())
            .sum()
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_swept(0);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_command_path() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("Order", 0.02);
        metrics.record_events_appended("Order", 3);
        metrics.record_concurrency_conflict("Order");

        assert_eq!(counter_value(&metrics, "es_events_appended_total"), 3.0);
        assert_eq!(counter_value(&metrics, "es_concurrency_conflicts_total"), 1.0);
    }

    #[test]
    fn test_record_publish() {
        let metrics = Metrics::new().unwrap();
        metrics.record_publish("orders-service-Order", 0.01, true);
        metrics.record_publish("orders-service-Order", 0.01, false);

        assert_eq!(counter_value(&metrics, "outbox_published_total"), 1.0);
        assert_eq!(counter_value(&metrics, "outbox_publish_failed_total"), 1.0);
    }

    #[test]
    fn test_record_dlq_message() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dlq_message("OrderCreated");
        metrics.record_dlq_message("OrderShipped");

        assert_eq!(counter_value(&metrics, "dlq_messages_total"), 2.0);
    }

    #[test]
    fn test_inbound_duplicates_counted_apart() {
        let metrics = Metrics::new().unwrap();
        metrics.record_inbound("order-summary", false);
        metrics.record_inbound("order-summary", true);
        metrics.record_inbound("order-summary", true);

        assert_eq!(counter_value(&metrics, "inbound_applied_total"), 1.0);
        assert_eq!(counter_value(&metrics, "inbound_duplicates_total"), 2.0);
    }

    #[test]
    fn test_inbound_skipped() {
        let metrics = Metrics::new().unwrap();
        metrics.record_inbound_skipped("orders-service-Order");
        assert_eq!(counter_value(&metrics, "inbound_skipped_total"), 1.0);
    }

    #[test]
    fn test_circuit_breaker_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.update_circuit_breaker_state(1); // Open

        let gathered = metrics.registry().gather();
        let state = gathered.iter().find(|m| m.name() == "circuit_breaker_state").unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(1.0));
    }
}
