use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::event::{deserialize_event, DomainEvent, EventStreamChangeEvent};
use crate::errors::NotificationError;

// ============================================================================
// Event Type Resolution
// ============================================================================
//
// Stored payloads outlive the code that wrote them. A migrator turns a
// stored change back into the aggregate's *current* event type:
//
//   stored (type, schema v1) --upcaster--> v2 --upcaster--> v3 --serde--> E
//
// Upcasters are registered per (event type, source schema version) and each
// one moves the payload exactly one version forward. Shapes no upcaster can
// rescue may still be handled by a fallback closure.
//
// ============================================================================

/// Rewrites one event type's JSON payload from `from_version` to `from_version + 1`.
pub trait EventUpcaster: Send + Sync {
    fn event_type(&self) -> &str;
    fn from_version(&self) -> i32;
    fn upcast(&self, event_json: &str) -> anyhow::Result<String>;
}

/// Resolves a stored change into a typed domain event.
pub trait EventMigrator<E>: Send + Sync {
    fn resolve(&self, change: &EventStreamChangeEvent) -> Result<E, NotificationError>;
}

type Fallback<E> = Arc<dyn Fn(&EventStreamChangeEvent) -> anyhow::Result<E> + Send + Sync>;

pub struct UpcastingMigrator<E> {
    upcasters: HashMap<(String, i32), Arc<dyn EventUpcaster>>,
    fallback: Option<Fallback<E>>,
    _event: PhantomData<fn() -> E>,
}

impl<E: DomainEvent> Default for UpcastingMigrator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: DomainEvent> UpcastingMigrator<E> {
    pub fn new() -> Self {
        Self {
            upcasters: HashMap::new(),
            fallback: None,
            _event: PhantomData,
        }
    }

    pub fn with_upcaster(mut self, upcaster: impl EventUpcaster + 'static) -> Self {
        let key = (upcaster.event_type().to_string(), upcaster.from_version());
        self.upcasters.insert(key, Arc::new(upcaster));
        self
    }

    /// Last resort for payloads that still fail to deserialize after upcasting.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&EventStreamChangeEvent) -> anyhow::Result<E> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    fn upcast(&self, change: &EventStreamChangeEvent) -> anyhow::Result<String> {
        let event_type = change.event_type();
        let mut version = change.metadata.schema_version;
        let mut payload = change.payload.clone();

        // Keys are unique and versions only move forward, so this terminates.
        while let Some(upcaster) = self.upcasters.get(&(event_type.to_string(), version)) {
            payload = upcaster.upcast(&payload)?;
            tracing::debug!(
                stream = %change.stream_name,
                version = change.version,
                event_type = %event_type,
                from_schema = version,
                "Upcasted stored event"
            );
            version += 1;
        }

        Ok(payload)
    }
}

impl<E: DomainEvent> EventMigrator<E> for UpcastingMigrator<E> {
    fn resolve(&self, change: &EventStreamChangeEvent) -> Result<E, NotificationError> {
        let resolution_error = |message: String| NotificationError::Resolution {
            stream: change.stream_name.clone(),
            version: change.version,
            event_type: change.event_type().to_string(),
            message,
        };

        let primary = self
            .upcast(change)
            .and_then(|payload| deserialize_event::<E>(&payload).map_err(anyhow::Error::from));

        match primary {
            Ok(event) => Ok(event),
            Err(primary_error) => match &self.fallback {
                Some(fallback) => fallback(change).map_err(|fallback_error| {
                    resolution_error(format!("{primary_error}; fallback: {fallback_error}"))
                }),
                None => Err(resolution_error(primary_error.to_string())),
            },
        }
    }
}
