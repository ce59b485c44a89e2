use std::sync::Arc;

use crate::errors::NotificationError;
use crate::messaging::{IntegrationEvent, MessageBroker};
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

/// Hands translated integration events to the broker.
///
/// Transient broker failures are retried with exponential backoff; a
/// rejected message or an exhausted retry budget surfaces as
/// `NotificationError::Publish`.
pub struct IntegrationPublisher {
    broker: Option<Arc<dyn MessageBroker>>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl IntegrationPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, retry: RetryConfig) -> Self {
        Self {
            broker: Some(broker),
            retry,
            metrics: None,
        }
    }

    /// No broker configured: translations are computed and dropped.
    pub fn disabled() -> Self {
        Self {
            broker: None,
            retry: RetryConfig::none(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.broker.is_some()
    }

    /// `Ok(false)` when publishing is disabled.
    pub async fn publish(&self, event: &IntegrationEvent) -> Result<bool, NotificationError> {
        let Some(broker) = &self.broker else {
            tracing::debug!(routing_key = %event.routing_key, "No broker configured, integration event dropped");
            return Ok(false);
        };

        let result = retry_on_transient(self.retry.clone(), |attempt| {
            tracing::debug!(
                attempt = attempt,
                routing_key = %event.routing_key,
                stream = %event.source_stream,
                "Publishing integration event"
            );
            broker.publish(event)
        })
        .await;

        let success = matches!(result, RetryResult::Success(_));
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(&event.routing_key, success);
        }

        result.into_result().map(|_| true).map_err(|source| {
            tracing::error!(
                routing_key = %event.routing_key,
                stream = %event.source_stream,
                version = event.source_version,
                error = %source,
                "❌ Integration event not published"
            );
            NotificationError::Publish {
                stream: event.source_stream.clone(),
                version: event.source_version,
                source,
            }
        })
    }
}
