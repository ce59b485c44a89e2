use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::publisher::IntegrationPublisher;
use crate::errors::NotificationError;
use crate::event_sourcing::core::{Aggregate, DomainEvent, EventEnvelope, EventMigrator, EventStreamChangeEvent};
use crate::messaging::IntegrationEvent;
use crate::metrics::Metrics;
use crate::notification::{StreamBatch, StreamBatchHandler};

// ============================================================================
// Relay Registry
// ============================================================================
//
// Built once at startup, read-only afterwards. One registration per
// aggregate type, keyed by the entity-type tag stored on every event:
//
//   "Booking" → migrator, translator?, [consumer, consumer, ...]
//
// Relaying one stored change:
// 1. resolve the payload to the typed domain event (migrator)
// 2. notify every consumer, in registration order, stopping at the first
//    failure
// 3. translate; publish the integration event if one comes out
//
// ============================================================================

/// In-process receiver of typed domain events.
#[async_trait]
pub trait DomainEventConsumer<E>: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, event: &EventEnvelope<E>) -> anyhow::Result<()>;
}

/// Maps a domain event to its cross-boundary contract, if it has one.
pub trait IntegrationEventTranslator<E>: Send + Sync {
    fn translate(&self, event: &EventEnvelope<E>) -> Result<Option<IntegrationEvent>, serde_json::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { consumers: usize, published: bool },
    /// No registration for the event's aggregate type; not an error
    Unregistered,
}

pub struct Registration<E> {
    aggregate_type: &'static str,
    migrator: Arc<dyn EventMigrator<E>>,
    translator: Option<Arc<dyn IntegrationEventTranslator<E>>>,
    consumers: Vec<Arc<dyn DomainEventConsumer<E>>>,
}

impl<E: DomainEvent> Registration<E> {
    pub fn for_aggregate<A: Aggregate<Event = E>>() -> Self {
        Self {
            aggregate_type: A::AGGREGATE_TYPE,
            migrator: A::migrator(),
            translator: None,
            consumers: Vec::new(),
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn IntegrationEventTranslator<E>>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn DomainEventConsumer<E>>) -> Self {
        self.consumers.push(consumer);
        self
    }
}

/// `Registration<E>` with the event type erased, so registrations for
/// different aggregates share one map.
#[async_trait]
trait RelayTarget: Send + Sync {
    fn consumer_names(&self) -> Vec<String>;
    fn has_translator(&self) -> bool;
    async fn relay(
        &self,
        change: &EventStreamChangeEvent,
        publisher: &IntegrationPublisher,
    ) -> Result<RelayOutcome, NotificationError>;
}

#[async_trait]
impl<E: DomainEvent> RelayTarget for Registration<E> {
    fn consumer_names(&self) -> Vec<String> {
        self.consumers.iter().map(|c| c.name().to_string()).collect()
    }

    fn has_translator(&self) -> bool {
        self.translator.is_some()
    }

    async fn relay(
        &self,
        change: &EventStreamChangeEvent,
        publisher: &IntegrationPublisher,
    ) -> Result<RelayOutcome, NotificationError> {
        let event = self.migrator.resolve(change)?;
        let envelope = EventEnvelope::from_change(change, event);

        for consumer in &self.consumers {
            consumer.notify(&envelope).await.map_err(|e| NotificationError::Consumer {
                consumer: consumer.name().to_string(),
                stream: change.stream_name.clone(),
                version: change.version,
                message: format!("{e:#}"),
            })?;
        }

        let mut published = false;
        if let Some(translator) = &self.translator {
            let translated = translator.translate(&envelope).map_err(|e| NotificationError::Consumer {
                consumer: format!("{}-translator", self.aggregate_type),
                stream: change.stream_name.clone(),
                version: change.version,
                message: e.to_string(),
            })?;
            if let Some(integration_event) = translated {
                published = publisher.publish(&integration_event).await?;
            }
        }

        Ok(RelayOutcome::Delivered {
            consumers: self.consumers.len(),
            published,
        })
    }
}

pub struct RelayRegistry {
    targets: HashMap<&'static str, Arc<dyn RelayTarget>>,
}

#[derive(Default)]
pub struct RelayRegistryBuilder {
    targets: HashMap<&'static str, Arc<dyn RelayTarget>>,
}

impl RelayRegistryBuilder {
    /// A second registration for the same aggregate type replaces the first.
    pub fn register<E: DomainEvent>(mut self, registration: Registration<E>) -> Self {
        let aggregate_type = registration.aggregate_type;
        if self.targets.insert(aggregate_type, Arc::new(registration)).is_some() {
            tracing::warn!(aggregate_type = aggregate_type, "Relay registration replaced");
        }
        self
    }

    pub fn build(self) -> RelayRegistry {
        for (aggregate_type, target) in &self.targets {
            tracing::info!(
                aggregate_type = %aggregate_type,
                consumers = ?target.consumer_names(),
                translator = target.has_translator(),
                "Relay registration"
            );
        }
        RelayRegistry { targets: self.targets }
    }
}

impl RelayRegistry {
    pub fn builder() -> RelayRegistryBuilder {
        RelayRegistryBuilder::default()
    }

    pub fn is_registered(&self, aggregate_type: &str) -> bool {
        self.targets.contains_key(aggregate_type)
    }

    pub async fn relay(
        &self,
        change: &EventStreamChangeEvent,
        publisher: &IntegrationPublisher,
    ) -> Result<RelayOutcome, NotificationError> {
        match self.targets.get(change.entity_type.as_str()) {
            Some(target) => target.relay(change, publisher).await,
            None => {
                tracing::debug!(
                    entity_type = %change.entity_type,
                    stream = %change.stream_name,
                    "No relay registration, skipping"
                );
                Ok(RelayOutcome::Unregistered)
            }
        }
    }
}

/// Relays each ordered batch event by event; a failure stops the rest of
/// that stream's batch so a consumer never sees version N+1 before N.
pub struct RegistryBatchHandler {
    relay: &'static str,
    registry: Arc<RelayRegistry>,
    publisher: Arc<IntegrationPublisher>,
    metrics: Option<Arc<Metrics>>,
}

impl RegistryBatchHandler {
    pub fn new(relay: &'static str, registry: Arc<RelayRegistry>, publisher: Arc<IntegrationPublisher>) -> Self {
        Self {
            relay,
            registry,
            publisher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl StreamBatchHandler for RegistryBatchHandler {
    async fn handle_batch(&self, batch: &StreamBatch) -> Result<(), NotificationError> {
        let started = Instant::now();

        for change in batch.events() {
            match self.registry.relay(change, &self.publisher).await {
                Ok(RelayOutcome::Delivered { .. }) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_relayed(self.relay, &change.entity_type, 1);
                    }
                }
                Ok(RelayOutcome::Unregistered) => {}
                Err(error) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_consumer_failure(self.relay, &change.entity_type);
                    }
                    return Err(error);
                }
            }
        }

        tracing::debug!(
            relay = self.relay,
            stream = %batch.stream_name(),
            events = batch.events().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Relayed stream batch"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event_sourcing::core::{EventMetadata, NewEvent};
    use crate::messaging::InMemoryBroker;
    use crate::utils::RetryConfig;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum GateEvent {
        Opened { by: String },
        Closed,
    }

    impl DomainEvent for GateEvent {
        fn event_type(&self) -> &'static str {
            match self {
                GateEvent::Opened { .. } => "GateOpened",
                GateEvent::Closed => "GateClosed",
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct Gate {
        open: bool,
    }

    impl Aggregate for Gate {
        const AGGREGATE_TYPE: &'static str = "Gate";
        type Event = GateEvent;
        type Command = GateEvent;
        type Error = std::io::Error;

        fn apply(&mut self, event: &GateEvent) {
            self.open = matches!(event, GateEvent::Opened { .. });
        }

        fn handle_command(&self, command: &GateEvent) -> Result<Vec<GateEvent>, std::io::Error> {
            Ok(vec![command.clone()])
        }
    }

    /// Records versions it sees; fails on `fail_on`.
    #[derive(Default)]
    pub(crate) struct Recording {
        pub seen: Mutex<Vec<i64>>,
        pub fail_on: Option<i64>,
    }

    #[async_trait]
    impl DomainEventConsumer<GateEvent> for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn notify(&self, event: &EventEnvelope<GateEvent>) -> anyhow::Result<()> {
            self.seen.lock().await.push(event.sequence_number);
            if self.fail_on == Some(event.sequence_number) {
                anyhow::bail!("refused version {}", event.sequence_number);
            }
            Ok(())
        }
    }

    pub(crate) struct OpenedTranslator;

    impl IntegrationEventTranslator<GateEvent> for OpenedTranslator {
        fn translate(&self, event: &EventEnvelope<GateEvent>) -> Result<Option<IntegrationEvent>, serde_json::Error> {
            match &event.event_data {
                GateEvent::Opened { by } => {
                    IntegrationEvent::from_envelope("gate.opened", event, &serde_json::json!({ "by": by })).map(Some)
                }
                GateEvent::Closed => Ok(None),
            }
        }
    }

    pub(crate) fn gate_change(stream: &str, version: i64, event: &GateEvent) -> EventStreamChangeEvent {
        let new = NewEvent::from_domain(Gate::AGGREGATE_TYPE, Uuid::new_v4(), event, Uuid::new_v4()).unwrap();
        EventStreamChangeEvent::from_new(stream, version, new, Utc::now())
    }

    fn opened(by: &str) -> GateEvent {
        GateEvent::Opened { by: by.to_string() }
    }

    #[tokio::test]
    async fn test_consumers_then_translator() {
        let consumer = Arc::new(Recording::default());
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = IntegrationPublisher::new(broker.clone(), RetryConfig::none());
        let registry = RelayRegistry::builder()
            .register(
                Registration::for_aggregate::<Gate>()
                    .with_consumer(consumer.clone())
                    .with_translator(Arc::new(OpenedTranslator)),
            )
            .build();

        let outcome = registry.relay(&gate_change("gate-1", 1, &opened("ann")), &publisher).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Delivered { consumers: 1, published: true });

        let outcome = registry.relay(&gate_change("gate-1", 2, &GateEvent::Closed), &publisher).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Delivered { consumers: 1, published: false });

        assert_eq!(*consumer.seen.lock().await, vec![1, 2]);
        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].source_version, 1);
    }

    #[tokio::test]
    async fn test_unknown_entity_type_is_unregistered() {
        let registry = RelayRegistry::builder().build();
        let mut change = gate_change("gate-1", 1, &GateEvent::Closed);
        change.entity_type = "Invoice".to_string();

        let outcome = registry.relay(&change, &IntegrationPublisher::disabled()).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Unregistered);
    }

    #[tokio::test]
    async fn test_unresolvable_payload_is_resolution_error() {
        let registry = RelayRegistry::builder()
            .register(Registration::for_aggregate::<Gate>())
            .build();
        let change = EventStreamChangeEvent {
            payload: r#"{"type":"Painted"}"#.to_string(),
            metadata: EventMetadata {
                event_type: "GatePainted".to_string(),
                ..gate_change("gate-1", 1, &GateEvent::Closed).metadata
            },
            ..gate_change("gate-1", 1, &GateEvent::Closed)
        };

        let error = registry.relay(&change, &IntegrationPublisher::disabled()).await.unwrap_err();
        assert!(matches!(error, NotificationError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure() {
        let consumer = Arc::new(Recording {
            fail_on: Some(2),
            ..Recording::default()
        });
        let registry = Arc::new(
            RelayRegistry::builder()
                .register(Registration::for_aggregate::<Gate>().with_consumer(consumer.clone()))
                .build(),
        );
        let handler = RegistryBatchHandler::new("test", registry, Arc::new(IntegrationPublisher::disabled()));
        let batch = StreamBatch::new(
            "gate-1",
            (1..=3).map(|v| gate_change("gate-1", v, &GateEvent::Closed)).collect(),
        );

        let error = handler.handle_batch(&batch).await.unwrap_err();
        assert_eq!(error.position(), Some(("gate-1", 2)));
        assert_eq!(*consumer.seen.lock().await, vec![1, 2]);
    }
}
