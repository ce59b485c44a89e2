use futures_util::future::join_all;
use kameo::actor::ActorRef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::dlq::{AddToDlq, DlqActor};
use super::{Destination, DrainClient, InboundMessage, MessageSource, RoutingTable};
use crate::config::WorkerConfig;
use crate::errors::WorkerError;
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerError, CircuitState, IsTransient};

// ============================================================================
// Cross-Process Relay Worker
// ============================================================================
//
// Broker message → routing table → typed pipeline → drain endpoint(s).
//
// Outcome per message:
// - every destination accepted it          → complete
// - a destination failed (or its breaker   → abandon, broker redelivers to
//   is open), attempts left                  every destination of the route
// - unknown route, payload outside its     → dead-letter
//   contract, drain refused the payload,
//   or attempts exhausted
//
// No business logic lives here.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Completed { destinations: usize },
    Abandoned { reason: String },
    DeadLettered { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub abandoned: usize,
    pub dead_lettered: usize,
}

struct DestinationHealth {
    breaker: CircuitBreaker,
    consecutive_failures: AtomicU32,
}

pub struct CrossProcessRelayWorker {
    source: Arc<dyn MessageSource>,
    routes: RoutingTable,
    drain: Arc<dyn DrainClient>,
    health: HashMap<String, DestinationHealth>,
    dlq: Option<ActorRef<DlqActor>>,
    metrics: Option<Arc<Metrics>>,
    max_delivery_attempts: u32,
    abandon_backoff: Duration,
    receive_timeout: Duration,
}

impl CrossProcessRelayWorker {
    pub fn new(
        source: Arc<dyn MessageSource>,
        routes: RoutingTable,
        drain: Arc<dyn DrainClient>,
        config: &WorkerConfig,
    ) -> Self {
        let health = routes
            .destinations()
            .into_iter()
            .map(|destination| {
                (
                    destination.name.clone(),
                    DestinationHealth {
                        breaker: CircuitBreaker::new(destination.name.as_str(), config.breaker()),
                        consecutive_failures: AtomicU32::new(0),
                    },
                )
            })
            .collect();

        Self {
            source,
            routes,
            drain,
            health,
            dlq: None,
            metrics: None,
            max_delivery_attempts: config.max_delivery_attempts.max(1),
            abandon_backoff: config.abandon_backoff(),
            receive_timeout: config.receive_timeout(),
        }
    }

    pub fn with_dlq(mut self, dlq: ActorRef<DlqActor>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consecutive_failures(&self, destination: &str) -> Option<u32> {
        self.health
            .get(destination)
            .map(|h| h.consecutive_failures.load(Ordering::SeqCst))
    }

    pub async fn breaker_state(&self, destination: &str) -> Option<CircuitState> {
        match self.health.get(destination) {
            Some(h) => Some(h.breaker.get_state().await),
            None => None,
        }
    }

    /// Receive and settle messages until `shutdown` flips to true.
    ///
    /// Shutdown is observed between messages; a drain call already in
    /// flight runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        tracing::info!(
            destinations = self.health.len(),
            max_attempts = self.max_delivery_attempts,
            "🚀 Relay worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                Ok(_) = shutdown.wait_for(|stop| *stop) => break,
                received = self.source.receive(self.receive_timeout) => received,
            };

            match received {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle(&message).await {
                        tracing::error!(message_id = %message.id, error = %e, "Failed to settle message");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Message source failed, backing off");
                    tokio::time::sleep(self.abandon_backoff).await;
                }
            }
        }

        tracing::info!("Relay worker stopped");
        Ok(())
    }

    /// Settle everything currently queued, including redeliveries caused
    /// by this drain.
    pub async fn drain(&self) -> Result<DrainSummary, WorkerError> {
        let mut summary = DrainSummary::default();
        while let Some(message) = self.source.receive(Duration::ZERO).await? {
            match self.handle(&message).await? {
                Disposition::Completed { .. } => summary.completed += 1,
                Disposition::Abandoned { .. } => summary.abandoned += 1,
                Disposition::DeadLettered { .. } => summary.dead_lettered += 1,
            }
        }
        Ok(summary)
    }

    /// Deliver one message and settle it at the source.
    pub async fn handle(&self, message: &InboundMessage) -> Result<Disposition, WorkerError> {
        let (route, body) = match self.prepare(message) {
            Ok(prepared) => prepared,
            Err(e) => return self.dead_letter(message, &e.to_string()).await,
        };

        let outcomes = join_all(
            route
                .destinations
                .iter()
                .map(|destination| self.forward(destination, &message.routing_key, &body)),
        )
        .await;

        let failure = outcomes.into_iter().find_map(Result::err);
        match failure {
            None => {
                self.source.complete(message).await?;
                tracing::info!(
                    message_id = %message.id,
                    routing_key = %message.routing_key,
                    destinations = route.destinations.len(),
                    "✅ Message relayed"
                );
                Ok(Disposition::Completed {
                    destinations: route.destinations.len(),
                })
            }
            Some(e) if !e.is_transient() => self.dead_letter(message, &e.to_string()).await,
            Some(e) if message.delivery_count >= self.max_delivery_attempts => {
                let reason = format!("gave up after {} deliveries: {e}", message.delivery_count);
                self.dead_letter(message, &reason).await
            }
            Some(e) => {
                self.source.abandon(message).await?;
                tracing::warn!(
                    message_id = %message.id,
                    routing_key = %message.routing_key,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "Message abandoned for redelivery"
                );
                if matches!(e, WorkerError::CircuitOpen(_)) {
                    tokio::time::sleep(self.abandon_backoff).await;
                }
                Ok(Disposition::Abandoned { reason: e.to_string() })
            }
        }
    }

    fn prepare(&self, message: &InboundMessage) -> Result<(&super::Route, serde_json::Value), WorkerError> {
        let route = self.routes.resolve(message.channel, &message.routing_key)?;
        let body = route.pipeline.prepare(&message.routing_key, &message.payload)?;
        Ok((route, body))
    }

    async fn forward(
        &self,
        destination: &Destination,
        routing_key: &str,
        body: &serde_json::Value,
    ) -> Result<(), WorkerError> {
        let Some(health) = self.health.get(&destination.name) else {
            return self.drain.deliver(destination, routing_key, body).await;
        };

        let result = match health
            .breaker
            .call(self.drain.deliver(destination, routing_key, body))
            .await
        {
            Ok(()) => Ok(()),
            Err(CircuitBreakerError::CircuitOpen) => Err(WorkerError::CircuitOpen(destination.name.clone())),
            Err(CircuitBreakerError::OperationFailed(e)) => Err(e),
        };

        let failures = match &result {
            Ok(()) => {
                health.consecutive_failures.store(0, Ordering::SeqCst);
                if let Some(metrics) = &self.metrics {
                    metrics.record_forward(&destination.name);
                }
                0
            }
            Err(e) => {
                let failures = health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(
                    destination = %destination.name,
                    consecutive_failures = failures,
                    error = %e,
                    "Drain call failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_abandon(&destination.name, abandon_reason(e));
                }
                failures
            }
        };

        if let Some(metrics) = &self.metrics {
            let state = health.breaker.get_state().await;
            metrics.update_destination_health(&destination.name, state.as_gauge(), failures);
        }

        result
    }

    async fn dead_letter(&self, message: &InboundMessage, reason: &str) -> Result<Disposition, WorkerError> {
        self.source.dead_letter(message, reason).await?;

        if let Some(dlq) = &self.dlq {
            let handed_off = dlq
                .tell(AddToDlq {
                    id: message.id,
                    routing_key: message.routing_key.clone(),
                    payload: message.payload.clone(),
                    error_message: reason.to_string(),
                    delivery_count: message.delivery_count,
                })
                .send()
                .await;
            if let Err(e) = handed_off {
                tracing::error!(
                    message_id = %message.id,
                    error = %e,
                    "Dead letter not recorded in DLQ actor, source copy only"
                );
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter();
        }

        tracing::error!(
            message_id = %message.id,
            routing_key = %message.routing_key,
            reason = %reason,
            "💀 Message dead-lettered"
        );
        Ok(Disposition::DeadLettered {
            reason: reason.to_string(),
        })
    }
}

fn abandon_reason(error: &WorkerError) -> &'static str {
    match error {
        WorkerError::CircuitOpen(_) => "circuit_open",
        WorkerError::Http { .. } => "http_status",
        WorkerError::Transport { .. } => "transport",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::dlq::GetDlqStats;
    use crate::worker::{Channel, InMemoryDrainClient, InMemoryQueue};
    use kameo::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        id: u32,
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            max_delivery_attempts: 3,
            breaker_failure_threshold: 2,
            abandon_backoff_ms: 0,
            ..WorkerConfig::default()
        }
    }

    fn routes() -> RoutingTable {
        RoutingTable::new()
            .queue::<Ping>("ping", Destination::new("billing", "http://billing/drain", "s1"))
            .subscribe::<Ping>("ping", Destination::new("billing", "http://billing/drain", "s1"))
            .subscribe::<Ping>("ping", Destination::new("fleet", "http://fleet/drain", "s2"))
    }

    fn worker(queue: &Arc<InMemoryQueue>, drain: &Arc<InMemoryDrainClient>, config: WorkerConfig) -> CrossProcessRelayWorker {
        CrossProcessRelayWorker::new(queue.clone(), routes(), drain.clone(), &config)
    }

    #[tokio::test]
    async fn test_topic_message_fans_out() {
        let queue = Arc::new(InMemoryQueue::new());
        let drain = Arc::new(InMemoryDrainClient::new());
        queue.enqueue(Channel::Topic, "ping", r#"{"id":1}"#).await;

        let summary = worker(&queue, &drain, config()).drain().await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(drain.delivered_to("billing").await.len(), 1);
        assert_eq!(drain.delivered_to("fleet").await.len(), 1);
        assert_eq!(queue.completed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_abandoned_then_delivered() {
        let queue = Arc::new(InMemoryQueue::new());
        let drain = Arc::new(InMemoryDrainClient::new());
        drain.fail_next("billing", 1, 503).await;
        queue.enqueue(Channel::Queue, "ping", r#"{"id":1}"#).await;

        let worker = worker(&queue, &drain, config());
        let summary = worker.drain().await.unwrap();

        assert_eq!(summary, DrainSummary { completed: 1, abandoned: 1, dead_lettered: 0 });
        assert_eq!(queue.completed().await[0].delivery_count, 2);
        assert_eq!(worker.consecutive_failures("billing"), Some(0));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_dead_lettered() {
        let queue = Arc::new(InMemoryQueue::new());
        let drain = Arc::new(InMemoryDrainClient::new());
        drain.fail_next("billing", 10, 503).await;
        queue.enqueue(Channel::Queue, "ping", r#"{"id":1}"#).await;

        let dlq = DlqActor::spawn(DlqActor::new(16));
        let config = WorkerConfig {
            breaker_failure_threshold: 10,
            ..config()
        };
        let worker = worker(&queue, &drain, config).with_dlq(dlq.clone());
        let summary = worker.drain().await.unwrap();

        assert_eq!(summary.abandoned, 2);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(queue.dead_lettered().await.len(), 1);
        assert_eq!(worker.consecutive_failures("billing"), Some(3));

        let stats = dlq.ask(GetDlqStats).send().await.unwrap();
        assert_eq!(stats.held, 1);
    }

    #[tokio::test]
    async fn test_stopped_dlq_actor_does_not_fail_dead_lettering() {
        let queue = Arc::new(InMemoryQueue::new());
        let drain = Arc::new(InMemoryDrainClient::new());
        queue.enqueue(Channel::Queue, "unknown", "{}").await;

        let dlq = DlqActor::spawn(DlqActor::new(16));
        dlq.stop_gracefully().await.unwrap();
        dlq.wait_for_shutdown().await;

        let summary = worker(&queue, &drain, config()).with_dlq(dlq).drain().await.unwrap();

        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(queue.dead_lettered().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_drain_call() {
        let queue = Arc::new(InMemoryQueue::new());
        let drain = Arc::new(InMemoryDrainClient::new());
        drain.fail_next("billing", 2, 503).await;
        let worker = worker(&queue, &drain, WorkerConfig { max_delivery_attempts: 10, ..config() });

        for _ in 0..3 {
            queue.enqueue(Channel::Queue, "ping", r#"{"id":1}"#).await;
            let message = queue.receive(Duration::ZERO).await.unwrap().unwrap();
            worker.handle(&message).await.unwrap();
        }

        assert_eq!(worker.breaker_state("billing").await, Some(CircuitState::Open));
        // third call never reached the client
        assert!(drain.delivered().await.is_empty());
        assert_eq!(worker.consecutive_failures("billing"), Some(3));
    }

    #[tokio::test]
    async fn test_permanent_errors_skip_redelivery() {
        let queue = Arc::new(InMemoryQueue::new());
        let drain = Arc::new(InMemoryDrainClient::new());
        queue.enqueue(Channel::Queue, "unknown", "{}").await;
        queue.enqueue(Channel::Queue, "ping", r#"{"wrong":true}"#).await;
        drain.fail_next("billing", 1, 400).await;
        queue.enqueue(Channel::Queue, "ping", r#"{"id":2}"#).await;

        let summary = worker(&queue, &drain, config()).drain().await.unwrap();

        assert_eq!(summary.dead_lettered, 3);
        assert_eq!(summary.abandoned, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new());
        let drain = Arc::new(InMemoryDrainClient::new());
        let worker = Arc::new(worker(&queue, &drain, config()));
        let (stop, shutdown) = watch::channel(false);

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(shutdown).await }
        });
        queue.enqueue(Channel::Queue, "ping", r#"{"id":1}"#).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.completed().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message completed");
        stop.send(true).unwrap();

        running.await.unwrap().unwrap();
        assert_eq!(queue.completed().await.len(), 1);
    }
}
