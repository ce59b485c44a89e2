use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::batch::Batch;
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::event_store::{announce, number_events, validate_append, AppendOutcome, EventStore, StreamChanged};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::event_sourcing::core::{EventMetadata, EventStreamChangeEvent, NewEvent};
use crate::utils::{retry_with_backoff, RetryConfig};

// ============================================================================
// ScyllaDB Event Store
// ============================================================================
//
// One partition per stream: PRIMARY KEY (stream_name, version).
//
// Append:
// 1. read the stream's highest version; reject if it is not expected
// 2. write all rows as ONE single-partition conditional batch
//    (IF NOT EXISTS), so a writer that raced past step 1 loses at the
//    Paxos round and nothing of its batch is applied
//
// The table has CDC enabled; `relay::CdcChangeFeed` turns its log back into
// stream-changed notifications for other processes.
//
// ============================================================================

pub const EVENT_STREAMS_TABLE: &str = "event_streams";

type EventRow = (
    String,
    i64,
    Uuid,
    String,
    String,
    i32,
    String,
    Uuid,
    String,
    Uuid,
    Option<Uuid>,
    DateTime<Utc>,
    DateTime<Utc>,
);

pub struct ScyllaEventStore {
    session: Arc<Session>,
    keyspace: String,
    insert_cql: String,
    select_cql: String,
    version_cql: String,
    notifications: broadcast::Sender<StreamChanged>,
}

fn transient(e: impl std::fmt::Display) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn defect(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Defect(anyhow::anyhow!("{context}: {e}"))
}

impl ScyllaEventStore {
    pub fn new(session: Arc<Session>, keyspace: &str, notification_capacity: usize) -> Self {
        let table = format!("{keyspace}.{EVENT_STREAMS_TABLE}");
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));

        Self {
            session,
            keyspace: keyspace.to_string(),
            insert_cql: format!(
                "INSERT INTO {table} (
                    stream_name, version, event_id, event_type, type_name, schema_version,
                    entity_type, aggregate_id, payload, correlation_id, causation_id,
                    occurred_at, persisted_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS"
            ),
            select_cql: format!(
                "SELECT stream_name, version, event_id, event_type, type_name, schema_version,
                        entity_type, aggregate_id, payload, correlation_id, causation_id,
                        occurred_at, persisted_at
                 FROM {table}
                 WHERE stream_name = ?
                 ORDER BY version ASC"
            ),
            version_cql: format!(
                "SELECT version FROM {table} WHERE stream_name = ? ORDER BY version DESC LIMIT 1"
            ),
            notifications,
        }
    }

    /// Connect to the configured node, retrying while the cluster starts.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        tracing::info!(node = %config.scylla_node, "Connecting to ScyllaDB...");

        let node = config.scylla_node.clone();
        let session = retry_with_backoff(RetryConfig::aggressive(), |_attempt| {
            let node = node.clone();
            async move { SessionBuilder::new().known_node(node).build().await }
        })
        .await
        .into_result()
        .map_err(transient)?;

        let store = Self::new(Arc::new(session), &config.keyspace, config.notification_capacity);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// Create keyspace and table (CDC enabled) if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                    self.keyspace
                ),
                &[],
            )
            .await
            .map_err(transient)?;

        self.session
            .query_unpaged(
                format!(
                    "CREATE TABLE IF NOT EXISTS {}.{} (
                        stream_name text,
                        version bigint,
                        event_id uuid,
                        event_type text,
                        type_name text,
                        schema_version int,
                        entity_type text,
                        aggregate_id uuid,
                        payload text,
                        correlation_id uuid,
                        causation_id uuid,
                        occurred_at timestamp,
                        persisted_at timestamp,
                        PRIMARY KEY (stream_name, version)
                    ) WITH CLUSTERING ORDER BY (version ASC)
                      AND cdc = {{'enabled': true}}",
                    self.keyspace, EVENT_STREAMS_TABLE
                ),
                &[],
            )
            .await
            .map_err(transient)?;

        tracing::info!(keyspace = %self.keyspace, table = EVENT_STREAMS_TABLE, "✅ Event stream schema ready");
        Ok(())
    }

    fn to_row(event: &EventStreamChangeEvent) -> EventRow {
        (
            event.stream_name.clone(),
            event.version,
            event.id,
            event.metadata.event_type.clone(),
            event.metadata.type_name.clone(),
            event.metadata.schema_version,
            event.entity_type.clone(),
            event.metadata.aggregate_id,
            event.payload.clone(),
            event.metadata.correlation_id,
            event.metadata.causation_id,
            event.metadata.occurred_at,
            event.persisted_at,
        )
    }

    fn from_row(row: EventRow) -> EventStreamChangeEvent {
        let (
            stream_name,
            version,
            id,
            event_type,
            type_name,
            schema_version,
            entity_type,
            aggregate_id,
            payload,
            correlation_id,
            causation_id,
            occurred_at,
            persisted_at,
        ) = row;

        EventStreamChangeEvent {
            id,
            stream_name,
            version,
            payload,
            metadata: EventMetadata {
                event_type,
                type_name,
                schema_version,
                aggregate_id,
                correlation_id,
                causation_id,
                occurred_at,
            },
            entity_type,
            persisted_at,
        }
    }

    fn conflict(&self, stream_name: &str, expected: i64, actual: i64) -> StoreError {
        tracing::warn!(
            stream = %stream_name,
            expected = expected,
            actual = actual,
            "Concurrency conflict, append rejected"
        );
        StoreError::ConcurrencyConflict {
            stream: stream_name.to_string(),
            expected,
            actual,
        }
    }
}

#[async_trait]
impl EventStore for ScyllaEventStore {
    async fn append(
        &self,
        stream_name: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<AppendOutcome, StoreError> {
        validate_append(stream_name, expected_version, &events)?;

        let current = self.current_version(stream_name).await?;
        if current != expected_version {
            return Err(self.conflict(stream_name, expected_version, current));
        }

        let appended = number_events(stream_name, expected_version, events, Utc::now());

        let mut batch = Batch::default();
        let mut values: Vec<EventRow> = Vec::with_capacity(appended.len());
        for event in &appended {
            batch.append_statement(self.insert_cql.as_str());
            values.push(Self::to_row(event));
        }

        let result = self.session.batch(&batch, values).await.map_err(transient)?;

        // LWT batches answer with an [applied] column first
        let applied = match result.into_rows_result() {
            Ok(rows) => match rows.maybe_first_row::<Row>() {
                Ok(Some(row)) => matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true)))),
                Ok(None) => false,
                Err(e) => return Err(defect("unreadable LWT result", e)),
            },
            Err(e) => return Err(defect("LWT batch returned no rows", e)),
        };

        if !applied {
            let actual = self.current_version(stream_name).await?;
            return Err(self.conflict(stream_name, expected_version, actual));
        }

        let new_version = expected_version + appended.len() as i64;
        // No stream lock here: racing writers may announce out of version
        // order, which the observer relay resequences from the store.
        announce(&self.notifications, stream_name, &appended);

        tracing::info!(
            stream = %stream_name,
            new_version = new_version,
            event_count = appended.len(),
            "✅ Appended events to event store"
        );

        Ok(AppendOutcome {
            new_version,
            events: appended,
        })
    }

    async fn load(&self, stream_name: &str) -> Result<Vec<EventStreamChangeEvent>, StoreError> {
        let result = self
            .session
            .query_unpaged(self.select_cql.as_str(), (stream_name,))
            .await
            .map_err(transient)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(Vec::new()),
        };

        let mut events = Vec::new();
        for row in rows_result.rows::<EventRow>().map_err(|e| defect("bad event row type", e))? {
            let row = row.map_err(|e| defect("undecodable event row", e))?;
            events.push(Self::from_row(row));
        }

        tracing::debug!(stream = %stream_name, count = events.len(), "Loaded stream");
        Ok(events)
    }

    async fn current_version(&self, stream_name: &str) -> Result<i64, StoreError> {
        let result = self
            .session
            .query_unpaged(self.version_cql.as_str(), (stream_name,))
            .await
            .map_err(transient)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(0),
        };

        match rows_result.maybe_first_row::<(i64,)>() {
            Ok(Some((version,))) => Ok(version),
            Ok(None) => Ok(0),
            Err(e) => Err(defect("unreadable version row", e)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamChanged> {
        self.notifications.subscribe()
    }
}
