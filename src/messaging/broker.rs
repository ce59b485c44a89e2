use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{IntegrationEvent, MessageBroker};
use crate::errors::BrokerError;
use crate::worker::{Channel, InMemoryQueue};

/// Broker held in process memory.
///
/// Records every publish and can bridge into an `InMemoryQueue`, standing in
/// for the transport between the relay and the relay worker.
#[derive(Default)]
pub struct InMemoryBroker {
    published: Mutex<Vec<IntegrationEvent>>,
    bridge: Option<(Arc<InMemoryQueue>, HashMap<String, Channel>)>,
    outages: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward publishes into `queue`; routing keys not listed in `channels`
    /// arrive on the topic channel.
    pub fn bridged_to(queue: Arc<InMemoryQueue>, channels: HashMap<String, Channel>) -> Self {
        Self {
            bridge: Some((queue, channels)),
            ..Self::default()
        }
    }

    /// Fail the next `count` publishes with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.outages.store(count, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<IntegrationEvent> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, event: &IntegrationEvent) -> Result<(), BrokerError> {
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(BrokerError::Transient("simulated broker outage".to_string()));
        }

        self.published.lock().await.push(event.clone());

        if let Some((queue, channels)) = &self.bridge {
            let channel = channels.get(&event.routing_key).copied().unwrap_or(Channel::Topic);
            queue.enqueue(channel, &event.routing_key, event.payload.clone()).await;
        }

        tracing::debug!(
            routing_key = %event.routing_key,
            stream = %event.source_stream,
            version = event.source_version,
            "📤 Published integration event"
        );
        Ok(())
    }
}
