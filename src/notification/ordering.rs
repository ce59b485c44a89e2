use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::NotificationError;
use crate::event_sourcing::core::EventStreamChangeEvent;
use crate::metrics::Metrics;

// ============================================================================
// Stream Ordering Handler
// ============================================================================
//
// Input: a flat list of change notifications, possibly interleaved across
// streams and out of order within one.
//
//   [A@2, B@1, A@1, A@4, B@2]
//        ↓ group by stream (first appearance), sort by version
//   A: [1, 2, 4]   → gap recorded, batch still forwarded
//   B: [1, 2]      → forwarded
//
// One failing (or panicking) stream never stops the others. Scope is one
// in-memory delivery cycle; this is not a durable resequencer.
//
// ============================================================================

/// Ordered events of one stream for one delivery cycle.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    stream_name: String,
    events: Vec<EventStreamChangeEvent>,
}

impl StreamBatch {
    /// Sort by version and drop duplicate versions (redelivered notifications).
    pub fn new(stream_name: impl Into<String>, mut events: Vec<EventStreamChangeEvent>) -> Self {
        events.sort_by_key(|e| e.version);
        events.dedup_by_key(|e| e.version);
        Self {
            stream_name: stream_name.into(),
            events,
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn events(&self) -> &[EventStreamChangeEvent] {
        &self.events
    }

    pub fn first_version(&self) -> Option<i64> {
        self.events.first().map(|e| e.version)
    }

    pub fn last_version(&self) -> Option<i64> {
        self.events.last().map(|e| e.version)
    }

    /// Versions absent between the first and last event of the batch.
    pub fn missing_versions(&self) -> Vec<i64> {
        self.events
            .windows(2)
            .flat_map(|pair| pair[0].version + 1..pair[1].version)
            .collect()
    }

    pub fn is_contiguous(&self) -> bool {
        self.events.windows(2).all(|pair| pair[1].version == pair[0].version + 1)
    }
}

#[async_trait]
pub trait StreamBatchHandler: Send + Sync {
    async fn handle_batch(&self, batch: &StreamBatch) -> Result<(), NotificationError>;
}

#[derive(Debug)]
pub enum StreamProcessingError {
    /// Batch had holes; it was still forwarded
    Gap { stream: String, missing: Vec<i64> },
    /// Handler returned an error or panicked
    Failed { stream: String, error: NotificationError },
}

impl StreamProcessingError {
    pub fn stream(&self) -> &str {
        match self {
            StreamProcessingError::Gap { stream, .. } | StreamProcessingError::Failed { stream, .. } => stream,
        }
    }
}

impl std::fmt::Display for StreamProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamProcessingError::Gap { stream, missing } => {
                write!(f, "stream '{stream}' is missing versions {missing:?}")
            }
            StreamProcessingError::Failed { stream, error } => write!(f, "stream '{stream}' failed: {error}"),
        }
    }
}

/// What one delivery cycle did.
#[derive(Debug, Default)]
pub struct OrderingReport {
    /// Streams whose batch was handed to the handler, in dispatch order
    pub dispatched: Vec<String>,
    pub errors: Vec<StreamProcessingError>,
}

impl OrderingReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn gaps(&self) -> impl Iterator<Item = (&str, &[i64])> {
        self.errors.iter().filter_map(|e| match e {
            StreamProcessingError::Gap { stream, missing } => Some((stream.as_str(), missing.as_slice())),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &NotificationError)> {
        self.errors.iter().filter_map(|e| match e {
            StreamProcessingError::Failed { stream, error } => Some((stream.as_str(), error)),
            _ => None,
        })
    }

    /// First handler failure. Gaps are operational signals, not failures.
    pub fn into_result(self) -> Result<(), NotificationError> {
        self.errors
            .into_iter()
            .find_map(|e| match e {
                StreamProcessingError::Failed { error, .. } => Some(error),
                StreamProcessingError::Gap { .. } => None,
            })
            .map_or(Ok(()), Err)
    }
}

pub struct StreamOrderingHandler {
    name: &'static str,
    handler: Arc<dyn StreamBatchHandler>,
    metrics: Option<Arc<Metrics>>,
}

impl StreamOrderingHandler {
    pub fn new(name: &'static str, handler: Arc<dyn StreamBatchHandler>) -> Self {
        Self {
            name,
            handler,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Group by stream in order of first appearance, one sorted batch each.
    pub fn group(events: Vec<EventStreamChangeEvent>) -> Vec<StreamBatch> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<EventStreamChangeEvent>> = HashMap::new();

        for event in events {
            if !groups.contains_key(&event.stream_name) {
                order.push(event.stream_name.clone());
            }
            groups.entry(event.stream_name.clone()).or_default().push(event);
        }

        order
            .into_iter()
            .filter_map(|stream| groups.remove(&stream).map(|events| StreamBatch::new(stream, events)))
            .collect()
    }

    pub async fn dispatch(&self, events: Vec<EventStreamChangeEvent>) -> OrderingReport {
        let batches = Self::group(events);
        let mut report = OrderingReport::default();

        for batch in &batches {
            let missing = batch.missing_versions();
            if !missing.is_empty() {
                tracing::warn!(
                    relay = self.name,
                    stream = %batch.stream_name(),
                    missing = ?missing,
                    "Gap in stream batch, forwarding anyway"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_gap(self.name);
                }
                report.errors.push(StreamProcessingError::Gap {
                    stream: batch.stream_name().to_string(),
                    missing,
                });
            }
        }

        let outcomes = join_all(batches.iter().map(|batch| self.run_isolated(batch))).await;

        for (batch, outcome) in batches.iter().zip(outcomes) {
            report.dispatched.push(batch.stream_name().to_string());
            if let Err(error) = outcome {
                tracing::error!(
                    relay = self.name,
                    stream = %batch.stream_name(),
                    error = %error,
                    "❌ Stream batch failed"
                );
                report.errors.push(StreamProcessingError::Failed {
                    stream: batch.stream_name().to_string(),
                    error,
                });
            }
        }

        report
    }

    async fn run_isolated(&self, batch: &StreamBatch) -> Result<(), NotificationError> {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle_batch(batch)).catch_unwind().await;

        if let Some(metrics) = &self.metrics {
            metrics.observe_batch(self.name, started.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(NotificationError::HandlerPanicked {
                    stream: batch.stream_name().to_string(),
                    message,
                })
            }
        }
    }
}
