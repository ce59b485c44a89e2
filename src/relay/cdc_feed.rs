use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kameo::actor::ActorRef;
use scylla::client::session::Session;
use scylla_cdc::consumer::{CDCRow, Consumer, ConsumerFactory, OperationType};
use scylla_cdc::log_reader::{CDCLogReader, CDCLogReaderBuilder};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::async_relay::ObserverRelay;
use crate::event_sourcing::core::{EventMetadata, EventStreamChangeEvent};
use crate::event_sourcing::store::{StreamChanged, EVENT_STREAMS_TABLE};

// ============================================================================
// CDC Change Feed - cross-process "stream changed" signal
// ============================================================================
//
// The event_streams table has CDC enabled. scylla-cdc reads its hidden log
// table; every inserted row is rebuilt into an EventStreamChangeEvent and
// told to the ObserverRelay, exactly like an in-process notification.
//
// Rows from one stream share a partition, so they arrive in version order.
//
// ============================================================================

fn text(row: &CDCRow<'_>, column: &str) -> anyhow::Result<String> {
    row.get_value(column)
        .as_ref()
        .and_then(|v| v.as_text())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid {column}"))
}

fn uuid(row: &CDCRow<'_>, column: &str) -> anyhow::Result<uuid::Uuid> {
    row.get_value(column)
        .as_ref()
        .and_then(|v| v.as_uuid())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid {column}"))
}

fn timestamp(row: &CDCRow<'_>, column: &str) -> anyhow::Result<DateTime<Utc>> {
    let millis = row
        .get_value(column)
        .as_ref()
        .and_then(|v| v.as_cql_timestamp())
        .map(|ts| ts.0)
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid {column}"))?;
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| anyhow::anyhow!("{column} out of range"))
}

/// Rebuild a stored change from a CDC log row; `None` for anything but an insert.
pub fn change_from_cdc_row(row: &CDCRow<'_>) -> anyhow::Result<Option<EventStreamChangeEvent>> {
    match row.operation {
        OperationType::RowInsert | OperationType::PostImage => {}
        _ => {
            tracing::debug!(cdc_operation = %row.operation, "Skipping non-insert CDC operation");
            return Ok(None);
        }
    }

    let version = row
        .get_value("version")
        .as_ref()
        .and_then(|v| v.as_bigint())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid version"))?;
    let schema_version = row
        .get_value("schema_version")
        .as_ref()
        .and_then(|v| v.as_int())
        .unwrap_or(1);
    let causation_id = row.get_value("causation_id").as_ref().and_then(|v| v.as_uuid());

    Ok(Some(EventStreamChangeEvent {
        id: uuid(row, "event_id")?,
        stream_name: text(row, "stream_name")?,
        version,
        payload: text(row, "payload")?,
        metadata: EventMetadata {
            event_type: text(row, "event_type")?,
            type_name: text(row, "type_name")?,
            schema_version,
            aggregate_id: uuid(row, "aggregate_id")?,
            correlation_id: uuid(row, "correlation_id")?,
            causation_id,
            occurred_at: timestamp(row, "occurred_at")?,
        },
        entity_type: text(row, "entity_type")?,
        persisted_at: timestamp(row, "persisted_at")?,
    }))
}

struct ChangeFeedConsumer {
    relay: ActorRef<ObserverRelay>,
}

#[async_trait]
impl Consumer for ChangeFeedConsumer {
    async fn consume_cdc(&mut self, data: CDCRow<'_>) -> anyhow::Result<()> {
        let Some(change) = change_from_cdc_row(&data)? else {
            return Ok(());
        };

        tracing::debug!(
            stream = %change.stream_name,
            version = change.version,
            event_type = %change.event_type(),
            "Change received from CDC log"
        );

        self.relay
            .tell(StreamChanged {
                stream_name: change.stream_name.clone(),
                events: vec![change],
            })
            .send()
            .await
            .map_err(|_| anyhow::anyhow!("observer relay unavailable"))
    }
}

struct ChangeFeedConsumerFactory {
    relay: ActorRef<ObserverRelay>,
}

#[async_trait]
impl ConsumerFactory for ChangeFeedConsumerFactory {
    async fn new_consumer(&self) -> Box<dyn Consumer> {
        tracing::debug!("Creating new ChangeFeedConsumer instance");
        Box::new(ChangeFeedConsumer {
            relay: self.relay.clone(),
        })
    }
}

/// A running CDC reader; `stop` ends it.
pub struct CdcChangeFeed {
    reader: CDCLogReader,
    task: JoinHandle<()>,
}

impl CdcChangeFeed {
    pub async fn start(session: Arc<Session>, keyspace: &str, relay: ActorRef<ObserverRelay>) -> anyhow::Result<Self> {
        tracing::info!(keyspace = %keyspace, table = EVENT_STREAMS_TABLE, "🔄 Starting CDC change feed");

        let factory = Arc::new(ChangeFeedConsumerFactory { relay });
        let (reader, handle) = CDCLogReaderBuilder::new()
            .session(session)
            .keyspace(keyspace)
            .table_name(EVENT_STREAMS_TABLE)
            .consumer_factory(factory)
            .build()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create CDC log reader: {}", e))?;

        let task = tokio::spawn(async move {
            match handle.await {
                Ok(_) => tracing::info!("CDC change feed completed"),
                Err(e) => tracing::error!(error = %e, "CDC change feed failed"),
            }
        });

        tracing::info!("✅ CDC change feed started");
        Ok(Self { reader, task })
    }

    pub async fn stop(mut self) {
        self.reader.stop();
        let _ = self.task.await;
    }
}
