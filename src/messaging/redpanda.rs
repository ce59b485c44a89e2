use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

use super::{IntegrationEvent, MessageBroker};
use crate::config::{RelayConfig, WorkerConfig};
use crate::errors::{BrokerError, WorkerError};
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use crate::worker::{BrokerReceipt, Channel, InboundMessage, MessageSource};

// ============================================================================
// Redpanda (Kafka API) transport
// ============================================================================
//
// Headers carried on every record:
//   routing-key     contract routing key, selects the worker pipeline
//   delivery-count  1 on first publish, bumped on every abandon
//   event-id        source event id
//
// Kafka has no native abandon: the source re-publishes the record with a
// bumped delivery count and commits the original offset.
//
// ============================================================================

const ROUTING_KEY_HEADER: &str = "routing-key";
const DELIVERY_COUNT_HEADER: &str = "delivery-count";
const EVENT_ID_HEADER: &str = "event-id";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

fn producer(brokers: &str) -> Result<FutureProducer, rdkafka::error::KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
}

fn headers(routing_key: &str, delivery_count: u32, event_id: &str) -> OwnedHeaders {
    let count = delivery_count.to_string();
    OwnedHeaders::new()
        .insert(Header {
            key: ROUTING_KEY_HEADER,
            value: Some(routing_key),
        })
        .insert(Header {
            key: DELIVERY_COUNT_HEADER,
            value: Some(&count),
        })
        .insert(Header {
            key: EVENT_ID_HEADER,
            value: Some(event_id),
        })
}

/// Publishes integration events, behind a circuit breaker.
pub struct RedpandaClient {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
    default_topic: String,
    topics: HashMap<String, String>,
}

impl RedpandaClient {
    pub fn new(config: &RelayConfig, default_topic: &str) -> Result<Self, BrokerError> {
        let producer = producer(&config.broker_servers)
            .map_err(|e| BrokerError::Rejected(format!("cannot create Redpanda producer: {e}")))?;

        Ok(Self {
            producer,
            circuit_breaker: CircuitBreaker::new(
                "redpanda",
                CircuitBreakerConfig {
                    failure_threshold: 5,
                    timeout: Duration::from_secs(30),
                    success_threshold: 3,
                },
            ),
            default_topic: default_topic.to_string(),
            topics: HashMap::new(),
        })
    }

    /// Send `routing_key` to `topic` instead of the default topic.
    pub fn with_topic(mut self, routing_key: &str, topic: &str) -> Self {
        self.topics.insert(routing_key.to_string(), topic.to_string());
        self
    }

    fn topic_for(&self, routing_key: &str) -> &str {
        self.topics
            .get(routing_key)
            .map(String::as_str)
            .unwrap_or(&self.default_topic)
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.get_state().await
    }
}

#[async_trait]
impl MessageBroker for RedpandaClient {
    async fn publish(&self, event: &IntegrationEvent) -> Result<(), BrokerError> {
        let topic = self.topic_for(&event.routing_key);
        let event_id = event.id.to_string();

        let result = self
            .circuit_breaker
            .call(async {
                let record = FutureRecord::to(topic)
                    .key(event.partition_key())
                    .payload(&event.payload)
                    .headers(headers(&event.routing_key, 1, &event_id));

                self.producer
                    .send(record, SEND_TIMEOUT)
                    .await
                    .map(|_| ())
                    .map_err(|(e, _)| e)
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    topic = %topic,
                    routing_key = %event.routing_key,
                    key = %event.partition_key(),
                    "📤 Published to Redpanda"
                );
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(topic = %topic, "Circuit breaker open - Redpanda unavailable");
                Err(BrokerError::Transient("circuit breaker open for Redpanda".to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, topic = %topic, "Failed to publish to Redpanda");
                Err(BrokerError::Transient(e.to_string()))
            }
        }
    }
}

/// Worker-side consumer with manual offset commits.
pub struct RedpandaSource {
    consumer: StreamConsumer,
    producer: FutureProducer,
    queue_topics: HashSet<String>,
}

impl RedpandaSource {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.broker_servers)
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| WorkerError::Source(format!("cannot create consumer: {e}")))?;

        let topics: Vec<&str> = config
            .queue_topics
            .iter()
            .chain(config.bus_topics.iter())
            .map(String::as_str)
            .collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| WorkerError::Source(format!("cannot subscribe to {topics:?}: {e}")))?;

        let producer = producer(&config.broker_servers)
            .map_err(|e| WorkerError::Source(format!("cannot create producer: {e}")))?;

        tracing::info!(topics = ?topics, group = %config.consumer_group, "✅ Subscribed to Redpanda");

        Ok(Self {
            consumer,
            producer,
            queue_topics: config.queue_topics.iter().cloned().collect(),
        })
    }

    fn commit(&self, receipt: &BrokerReceipt) -> Result<(), WorkerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&receipt.topic, receipt.partition, Offset::Offset(receipt.offset + 1))
            .map_err(|e| WorkerError::Source(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| WorkerError::Source(e.to_string()))
    }

    async fn republish(&self, topic: &str, message: &InboundMessage, delivery_count: u32) -> Result<(), WorkerError> {
        let event_id = message.id.to_string();
        let record = FutureRecord::to(topic)
            .key(&message.routing_key)
            .payload(&message.payload)
            .headers(headers(&message.routing_key, delivery_count, &event_id));

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| WorkerError::Source(format!("republish to {topic} failed: {e}")))
    }

    fn receipt(message: &InboundMessage) -> Result<&BrokerReceipt, WorkerError> {
        message
            .receipt
            .as_ref()
            .ok_or_else(|| WorkerError::Source(format!("message {} has no broker receipt", message.id)))
    }
}

#[async_trait]
impl MessageSource for RedpandaSource {
    async fn receive(&self, wait: Duration) -> Result<Option<InboundMessage>, WorkerError> {
        let received = match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received.map_err(|e| WorkerError::Source(e.to_string()))?,
        };

        let mut routing_key = None;
        let mut delivery_count = 1;
        let mut id = None;
        if let Some(headers) = received.headers() {
            for header in headers.iter() {
                let value = header.value.and_then(|v| std::str::from_utf8(v).ok());
                match (header.key, value) {
                    (ROUTING_KEY_HEADER, Some(v)) => routing_key = Some(v.to_string()),
                    (DELIVERY_COUNT_HEADER, Some(v)) => delivery_count = v.parse().unwrap_or(1),
                    (EVENT_ID_HEADER, Some(v)) => id = Uuid::parse_str(v).ok(),
                    _ => {}
                }
            }
        }

        let topic = received.topic().to_string();
        let payload = match received.payload_view::<str>() {
            Some(Ok(text)) => text.to_string(),
            Some(Err(_)) | None => String::new(),
        };
        let channel = if self.queue_topics.contains(&topic) {
            Channel::Queue
        } else {
            Channel::Topic
        };

        Ok(Some(InboundMessage {
            id: id.unwrap_or_else(Uuid::new_v4),
            channel,
            routing_key: routing_key.unwrap_or_else(|| topic.clone()),
            payload,
            delivery_count,
            receipt: Some(BrokerReceipt {
                topic,
                partition: received.partition(),
                offset: received.offset(),
            }),
        }))
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), WorkerError> {
        self.commit(Self::receipt(message)?)
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), WorkerError> {
        let receipt = Self::receipt(message)?;
        self.republish(&receipt.topic, message, message.delivery_count + 1).await?;
        self.commit(receipt)
    }

    async fn dead_letter(&self, message: &InboundMessage, reason: &str) -> Result<(), WorkerError> {
        let receipt = Self::receipt(message)?;
        let dlq_topic = format!("{}.dlq", receipt.topic);
        self.republish(&dlq_topic, message, message.delivery_count).await?;
        tracing::error!(topic = %dlq_topic, reason = %reason, "💀 Message parked on broker DLQ topic");
        self.commit(receipt)
    }
}
