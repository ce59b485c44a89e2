mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

pub use server::start_metrics_server;

// ============================================================================
// Metrics - Prometheus instrumentation for the relay pipeline
// ============================================================================
//
// Owned registry (no global default registry), shared as `Arc<Metrics>`.
// Every component takes it as an `Option` so tests can run without one.
//
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Relay
    pub events_relayed: IntCounterVec,
    pub consumer_failures: IntCounterVec,
    pub stream_gaps: IntCounterVec,
    pub relay_duration: HistogramVec,
    pub broker_publishes: IntCounterVec,

    // Projection
    pub projections: IntCounterVec,

    // Relay worker
    pub worker_forwards: IntCounterVec,
    pub worker_abandons: IntCounterVec,
    pub dead_letters: IntCounter,
    pub circuit_breaker_state: IntGaugeVec,
    pub consecutive_failures: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_relayed = IntCounterVec::new(
            Opts::new("relay_events_total", "Stored events relayed to in-process consumers"),
            &["relay", "aggregate_type"],
        )?;
        registry.register(Box::new(events_relayed.clone()))?;

        let consumer_failures = IntCounterVec::new(
            Opts::new("relay_consumer_failures_total", "Consumer or translator failures during relay"),
            &["relay", "aggregate_type"],
        )?;
        registry.register(Box::new(consumer_failures.clone()))?;

        let stream_gaps = IntCounterVec::new(
            Opts::new("relay_stream_gaps_total", "Batches forwarded with non-contiguous versions"),
            &["relay"],
        )?;
        registry.register(Box::new(stream_gaps.clone()))?;

        let relay_duration = HistogramVec::new(
            HistogramOpts::new("relay_batch_duration_seconds", "Time to relay one stream batch")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["relay"],
        )?;
        registry.register(Box::new(relay_duration.clone()))?;

        let broker_publishes = IntCounterVec::new(
            Opts::new("broker_publishes_total", "Integration events handed to the broker"),
            &["routing_key", "outcome"],
        )?;
        registry.register(Box::new(broker_publishes.clone()))?;

        let projections = IntCounterVec::new(
            Opts::new("projection_events_total", "Events offered to read-model projectors"),
            &["projection", "outcome"],
        )?;
        registry.register(Box::new(projections.clone()))?;

        let worker_forwards = IntCounterVec::new(
            Opts::new("worker_forwards_total", "Messages forwarded to drain endpoints"),
            &["destination"],
        )?;
        registry.register(Box::new(worker_forwards.clone()))?;

        let worker_abandons = IntCounterVec::new(
            Opts::new("worker_abandons_total", "Messages abandoned for broker redelivery"),
            &["destination", "reason"],
        )?;
        registry.register(Box::new(worker_abandons.clone()))?;

        let dead_letters = IntCounter::new("worker_dead_letters_total", "Messages moved to the dead letter queue")?;
        registry.register(Box::new(dead_letters.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "Circuit breaker state (0=Closed, 1=HalfOpen, 2=Open)"),
            &["destination"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let consecutive_failures = IntGaugeVec::new(
            Opts::new("destination_consecutive_failures", "Consecutive failed drain calls per destination"),
            &["destination"],
        )?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        Ok(Self {
            registry,
            events_relayed,
            consumer_failures,
            stream_gaps,
            relay_duration,
            broker_publishes,
            projections,
            worker_forwards,
            worker_abandons,
            dead_letters,
            circuit_breaker_state,
            consecutive_failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_relayed(&self, relay: &str, aggregate_type: &str, count: usize) {
        self.events_relayed
            .with_label_values(&[relay, aggregate_type])
            .inc_by(count as u64);
    }

    pub fn record_consumer_failure(&self, relay: &str, aggregate_type: &str) {
        self.consumer_failures.with_label_values(&[relay, aggregate_type]).inc();
    }

    pub fn record_gap(&self, relay: &str) {
        self.stream_gaps.with_label_values(&[relay]).inc();
    }

    pub fn observe_batch(&self, relay: &str, duration_secs: f64) {
        self.relay_duration.with_label_values(&[relay]).observe(duration_secs);
    }

    pub fn record_publish(&self, routing_key: &str, success: bool) {
        let outcome = if success { "published" } else { "failed" };
        self.broker_publishes.with_label_values(&[routing_key, outcome]).inc();
    }

    pub fn record_projection(&self, projection: &str, outcome: &str) {
        self.projections.with_label_values(&[projection, outcome]).inc();
    }

    pub fn record_forward(&self, destination: &str) {
        self.worker_forwards.with_label_values(&[destination]).inc();
    }

    pub fn record_abandon(&self, destination: &str, reason: &str) {
        self.worker_abandons.with_label_values(&[destination, reason]).inc();
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.inc();
    }

    pub fn update_destination_health(&self, destination: &str, breaker_state: i64, consecutive_failures: u32) {
        self.circuit_breaker_state
            .with_label_values(&[destination])
            .set(breaker_state);
        self.consecutive_failures
            .with_label_values(&[destination])
            .set(consecutive_failures as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dead_letter();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_relayed_accumulates() {
        let metrics = Metrics::new().unwrap();
        metrics.record_relayed("sync", "Booking", 3);
        metrics.record_relayed("sync", "Booking", 2);

        let gathered = metrics.registry().gather();
        let relayed = gathered.iter().find(|m| m.name() == "relay_events_total").unwrap();
        assert_eq!(relayed.metric[0].counter.value, Some(5.0));
    }

    #[test]
    fn test_destination_health_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.update_destination_health("billing", 2, 4);
        metrics.update_destination_health("notifications", 0, 0);

        let gathered = metrics.registry().gather();
        let state = gathered.iter().find(|m| m.name() == "circuit_breaker_state").unwrap();
        assert_eq!(state.metric.len(), 2);
        let failures = gathered
            .iter()
            .find(|m| m.name() == "destination_consecutive_failures")
            .unwrap();
        assert!(failures.metric.iter().any(|m| m.gauge.value == Some(4.0)));
    }
}
