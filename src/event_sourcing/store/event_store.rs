use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::errors::StoreError;
use crate::event_sourcing::core::{EventStreamChangeEvent, NewEvent};

// ============================================================================
// Event Store - append-only per-stream log
// ============================================================================
//
// Contract shared by every backend:
// 1. `append` writes all events or none
// 2. `append` fails with ConcurrencyConflict when the stored version is not
//    `expected_version`, leaving the stream untouched
// 3. versions start at 1 and are contiguous
// 4. every successful append is announced on the "stream changed" channel
//
// Writers to different streams never contend; the only mutual exclusion is
// the per-stream compare-and-swap on version.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub new_version: i64,
    /// The appended events in their persisted form, in version order
    pub events: Vec<EventStreamChangeEvent>,
}

/// Store-level signal that a stream gained events.
#[derive(Debug, Clone)]
pub struct StreamChanged {
    pub stream_name: String,
    pub events: Vec<EventStreamChangeEvent>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        stream_name: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<AppendOutcome, StoreError>;

    /// Whole stream in version order; empty for an unknown stream.
    async fn load(&self, stream_name: &str) -> Result<Vec<EventStreamChangeEvent>, StoreError>;

    /// Events with `version >= from_version`, in order.
    async fn load_from(
        &self,
        stream_name: &str,
        from_version: i64,
    ) -> Result<Vec<EventStreamChangeEvent>, StoreError> {
        let mut events = self.load(stream_name).await?;
        events.retain(|e| e.version >= from_version);
        Ok(events)
    }

    /// 0 for an unknown stream.
    async fn current_version(&self, stream_name: &str) -> Result<i64, StoreError>;

    async fn stream_exists(&self, stream_name: &str) -> Result<bool, StoreError> {
        Ok(self.current_version(stream_name).await? > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamChanged>;
}

/// Checks every backend runs before touching storage.
pub(crate) fn validate_append(stream_name: &str, expected_version: i64, events: &[NewEvent]) -> Result<(), StoreError> {
    if stream_name.trim().is_empty() {
        return Err(StoreError::Validation("stream name must not be empty".to_string()));
    }
    if expected_version < 0 {
        return Err(StoreError::Validation(format!(
            "expected version must be >= 0, got {expected_version}"
        )));
    }
    if events.is_empty() {
        return Err(StoreError::Validation("cannot append an empty event list".to_string()));
    }
    Ok(())
}

/// Number the events `expected_version + 1 ..`.
pub(crate) fn number_events(
    stream_name: &str,
    expected_version: i64,
    events: Vec<NewEvent>,
    persisted_at: DateTime<Utc>,
) -> Vec<EventStreamChangeEvent> {
    events
        .into_iter()
        .zip(expected_version + 1..)
        .map(|(event, version)| EventStreamChangeEvent::from_new(stream_name, version, event, persisted_at))
        .collect()
}

/// Broadcast is best effort: no subscribers is not an error.
pub(crate) fn announce(sender: &broadcast::Sender<StreamChanged>, stream_name: &str, events: &[EventStreamChangeEvent]) {
    let receivers = sender
        .send(StreamChanged {
            stream_name: stream_name.to_string(),
            events: events.to_vec(),
        })
        .unwrap_or(0);
    tracing::debug!(stream = %stream_name, receivers = receivers, "Announced stream change");
}
