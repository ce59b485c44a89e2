use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::event_store::{announce, number_events, validate_append, AppendOutcome, EventStore, StreamChanged};
use crate::errors::StoreError;
use crate::event_sourcing::core::{EventStreamChangeEvent, NewEvent};

type Stream = Arc<Mutex<Vec<EventStreamChangeEvent>>>;

/// Event store held in process memory.
///
/// The outer map lock is only held to find or create a stream; the
/// compare-and-swap runs under that stream's own lock.
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Stream>>,
    notifications: broadcast::Sender<StreamChanged>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventStore {
    pub fn new(notification_capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            streams: RwLock::new(HashMap::new()),
            notifications,
        }
    }

    async fn stream(&self, stream_name: &str) -> Stream {
        if let Some(stream) = self.streams.read().await.get(stream_name) {
            return stream.clone();
        }
        self.streams
            .write()
            .await
            .entry(stream_name.to_string())
            .or_default()
            .clone()
    }

    async fn existing(&self, stream_name: &str) -> Option<Stream> {
        self.streams.read().await.get(stream_name).cloned()
    }

    pub async fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_name: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<AppendOutcome, StoreError> {
        validate_append(stream_name, expected_version, &events)?;

        let stream = self.stream(stream_name).await;
        let mut stored = stream.lock().await;

        let current = stored.len() as i64;
        if current != expected_version {
            tracing::warn!(
                stream = %stream_name,
                expected = expected_version,
                actual = current,
                "Concurrency conflict, append rejected"
            );
            return Err(StoreError::ConcurrencyConflict {
                stream: stream_name.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        let appended = number_events(stream_name, expected_version, events, Utc::now());
        stored.extend(appended.iter().cloned());
        let new_version = stored.len() as i64;

        // Announce while still holding the stream lock so notifications for
        // one stream leave in version order.
        announce(&self.notifications, stream_name, &appended);
        drop(stored);

        tracing::info!(
            stream = %stream_name,
            new_version = new_version,
            event_count = appended.len(),
            "✅ Appended events"
        );

        Ok(AppendOutcome {
            new_version,
            events: appended,
        })
    }

    async fn load(&self, stream_name: &str) -> Result<Vec<EventStreamChangeEvent>, StoreError> {
        match self.existing(stream_name).await {
            Some(stream) => Ok(stream.lock().await.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn current_version(&self, stream_name: &str) -> Result<i64, StoreError> {
        match self.existing(stream_name).await {
            Some(stream) => Ok(stream.lock().await.len() as i64),
            None => Ok(0),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamChanged> {
        self.notifications.subscribe()
    }
}
