use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Domain Events and their stored form
// ============================================================================
//
// Three shapes of the same fact:
// - `E: DomainEvent`          typed, raised by an aggregate
// - `NewEvent`                serialized, on its way into the store
// - `EventStreamChangeEvent`  persisted, with stream name and version
//
// `EventEnvelope<E>` is what consumers see: the typed event plus the
// position and metadata of the change it was resolved from.
//
// ============================================================================

/// A typed, versioned fact about one aggregate.
///
/// Aggregates model their events as one enum; `event_type` returns the tag
/// of the variant, which is what gets stored and what projections dispatch on.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;

    /// Schema version of this variant's payload
    fn schema_version(&self) -> i32 {
        1
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventMetadata {
    pub event_type: String,
    /// Fully-qualified Rust type the payload was serialized from
    pub type_name: String,
    pub schema_version: i32,
    pub aggregate_id: Uuid,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

/// An event serialized for appending.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NewEvent {
    pub event_id: Uuid,
    /// Aggregate type tag; selects the relay registration
    pub entity_type: String,
    pub payload: String,
    pub metadata: EventMetadata,
}

impl NewEvent {
    pub fn from_domain<E: DomainEvent>(
        entity_type: &str,
        aggregate_id: Uuid,
        event: &E,
        correlation_id: Uuid,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::now_v7(),
            entity_type: entity_type.to_string(),
            payload: serialize_event(event)?,
            metadata: EventMetadata {
                event_type: event.event_type().to_string(),
                type_name: std::any::type_name::<E>().to_string(),
                schema_version: event.schema_version(),
                aggregate_id,
                correlation_id,
                causation_id: None,
                occurred_at: Utc::now(),
            },
        })
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.metadata.causation_id = Some(causation_id);
        self
    }
}

/// The persisted form of a domain event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventStreamChangeEvent {
    pub id: Uuid,
    pub stream_name: String,
    /// 1-based, contiguous within the stream
    pub version: i64,
    pub payload: String,
    pub metadata: EventMetadata,
    pub entity_type: String,
    pub persisted_at: DateTime<Utc>,
}

impl EventStreamChangeEvent {
    pub fn from_new(stream_name: &str, version: i64, event: NewEvent, persisted_at: DateTime<Utc>) -> Self {
        Self {
            id: event.event_id,
            stream_name: stream_name.to_string(),
            version,
            payload: event.payload,
            metadata: event.metadata,
            entity_type: event.entity_type,
            persisted_at,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.metadata.event_type
    }
}

/// A resolved event together with where it sits in its stream.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventEnvelope<E> {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub stream_name: String,
    pub sequence_number: i64,

    pub event_type: String,
    pub event_version: i32,
    pub event_data: E,

    pub causation_id: Option<Uuid>,
    pub correlation_id: Uuid,

    pub timestamp: DateTime<Utc>,
    pub persisted_at: DateTime<Utc>,
}

impl<E: DomainEvent> EventEnvelope<E> {
    /// Wrap a resolved payload. Type and version come from the resolved
    /// event, not the stored metadata, since an upcast may have changed them.
    pub fn from_change(change: &EventStreamChangeEvent, event_data: E) -> Self {
        Self {
            event_id: change.id,
            aggregate_id: change.metadata.aggregate_id,
            stream_name: change.stream_name.clone(),
            sequence_number: change.version,
            event_type: event_data.event_type().to_string(),
            event_version: event_data.schema_version(),
            event_data,
            causation_id: change.metadata.causation_id,
            correlation_id: change.metadata.correlation_id,
            timestamp: change.metadata.occurred_at,
            persisted_at: change.persisted_at,
        }
    }
}

pub fn serialize_event<E: Serialize>(event: &E) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

pub fn deserialize_event<E: DeserializeOwned>(json: &str) -> Result<E, serde_json::Error> {
    serde_json::from_str(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "type", content = "data")]
    enum LampEvent {
        SwitchedOn { watts: u32 },
        SwitchedOff,
    }

    impl DomainEvent for LampEvent {
        fn event_type(&self) -> &'static str {
            match self {
                LampEvent::SwitchedOn { .. } => "SwitchedOn",
                LampEvent::SwitchedOff => "SwitchedOff",
            }
        }
    }

    #[test]
    fn test_new_event_captures_metadata() {
        let aggregate_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        let new_event =
            NewEvent::from_domain("Lamp", aggregate_id, &LampEvent::SwitchedOn { watts: 40 }, correlation_id).unwrap();

        assert_eq!(new_event.entity_type, "Lamp");
        assert_eq!(new_event.metadata.event_type, "SwitchedOn");
        assert_eq!(new_event.metadata.aggregate_id, aggregate_id);
        assert!(new_event.metadata.type_name.ends_with("LampEvent"));
        assert!(new_event.payload.contains("\"watts\":40"));
    }

    #[test]
    fn test_envelope_from_change_keeps_position() {
        let new_event =
            NewEvent::from_domain("Lamp", Uuid::new_v4(), &LampEvent::SwitchedOff, Uuid::new_v4()).unwrap();
        let change = EventStreamChangeEvent::from_new("lamp-1", 4, new_event, Utc::now());

        let data: LampEvent = deserialize_event(&change.payload).unwrap();
        let envelope = EventEnvelope::from_change(&change, data);

        assert_eq!(envelope.stream_name, "lamp-1");
        assert_eq!(envelope.sequence_number, 4);
        assert_eq!(envelope.event_type, "SwitchedOff");
        assert_eq!(envelope.event_data, LampEvent::SwitchedOff);
        assert_eq!(envelope.event_id, change.id);
    }
}
