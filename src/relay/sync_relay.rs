use futures_util::FutureExt;
use std::sync::Arc;

use super::publisher::IntegrationPublisher;
use super::registry::{RegistryBatchHandler, RelayRegistry};
use crate::event_sourcing::core::EventStreamChangeEvent;
use crate::event_sourcing::store::SaveParticipant;
use crate::metrics::Metrics;
use crate::notification::{ChangeNotificationAggregator, OrderingReport, StreamOrderingHandler};

const RELAY_NAME: &str = "synchronous";

/// Relay wired into the save path.
///
/// Enlisted in every save's `ChangeNotificationAggregator`, so the caller
/// only sees success once every consumer has run (read-your-own-writes for
/// in-process projections). A consumer failure becomes the save's failure;
/// the events stay persisted.
pub struct SynchronousRelay {
    ordering: Arc<StreamOrderingHandler>,
}

impl SynchronousRelay {
    pub fn new(registry: Arc<RelayRegistry>, publisher: Arc<IntegrationPublisher>) -> Self {
        let handler = RegistryBatchHandler::new(RELAY_NAME, registry, publisher);
        Self {
            ordering: Arc::new(StreamOrderingHandler::new(RELAY_NAME, Arc::new(handler))),
        }
    }

    pub fn with_metrics(
        registry: Arc<RelayRegistry>,
        publisher: Arc<IntegrationPublisher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let handler = RegistryBatchHandler::new(RELAY_NAME, registry, publisher).with_metrics(metrics.clone());
        Self {
            ordering: Arc::new(StreamOrderingHandler::new(RELAY_NAME, Arc::new(handler)).with_metrics(metrics)),
        }
    }

    /// Relay `events` inline, outside of a save.
    pub async fn relay(&self, events: Vec<EventStreamChangeEvent>) -> OrderingReport {
        self.ordering.dispatch(events).await
    }
}

impl SaveParticipant for SynchronousRelay {
    fn name(&self) -> &str {
        "synchronous-relay"
    }

    fn enlist(&self, aggregator: &mut ChangeNotificationAggregator) {
        let ordering = self.ordering.clone();
        aggregator.add_tasks(move |events| {
            let events = events.to_vec();
            vec![async move {
                let report = ordering.dispatch(events).await;
                report.into_result()
            }
            .boxed()]
        });
    }
}
