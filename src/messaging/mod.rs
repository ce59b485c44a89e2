use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::BrokerError;
use crate::event_sourcing::core::EventEnvelope;

pub mod broker;
#[cfg(feature = "redpanda")]
pub mod redpanda;

pub use broker::InMemoryBroker;
#[cfg(feature = "redpanda")]
pub use redpanda::{RedpandaClient, RedpandaSource};

// ============================================================================
// Messaging - integration events and the broker seam
// ============================================================================

/// A cross-boundary event translated from a domain event.
///
/// `id` is the source event's id, so a re-drained publish carries the same
/// id and downstream drains can deduplicate.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IntegrationEvent {
    pub id: Uuid,
    pub routing_key: String,
    pub source_stream: String,
    pub source_version: i64,
    pub correlation_id: Uuid,
    pub payload: String,
    pub occurred_at: DateTime<Utc>,
}

impl IntegrationEvent {
    pub fn from_envelope<E, T: Serialize>(
        routing_key: &str,
        envelope: &EventEnvelope<E>,
        contract: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: envelope.event_id,
            routing_key: routing_key.to_string(),
            source_stream: envelope.stream_name.clone(),
            source_version: envelope.sequence_number,
            correlation_id: envelope.correlation_id,
            payload: serde_json::to_string(contract)?,
            occurred_at: envelope.timestamp,
        })
    }

    /// Broker partition key; one stream maps to one partition.
    pub fn partition_key(&self) -> &str {
        &self.source_stream
    }
}

/// Fire-and-forget hand-off to an external pub/sub transport.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, event: &IntegrationEvent) -> Result<(), BrokerError>;
}
