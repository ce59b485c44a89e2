use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::errors::WorkerError;

/// Which routing table a message is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Point-to-point: one destination
    Queue,
    /// Pub/sub: every subscribed destination
    Topic,
}

/// Position of a message at the broker, for sources that acknowledge by offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: Uuid,
    pub channel: Channel,
    pub routing_key: String,
    pub payload: String,
    /// 1 on first delivery
    pub delivery_count: u32,
    pub receipt: Option<BrokerReceipt>,
}

/// Broker client as seen by the relay worker.
///
/// Every received message must end in exactly one of `complete`, `abandon`
/// (broker redelivers with a higher delivery count) or `dead_letter`.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// `None` when nothing arrived within `wait`.
    async fn receive(&self, wait: Duration) -> Result<Option<InboundMessage>, WorkerError>;
    async fn complete(&self, message: &InboundMessage) -> Result<(), WorkerError>;
    async fn abandon(&self, message: &InboundMessage) -> Result<(), WorkerError>;
    async fn dead_letter(&self, message: &InboundMessage, reason: &str) -> Result<(), WorkerError>;
}

/// Queue held in process memory; abandoned messages go to the back with
/// their delivery count bumped.
#[derive(Default)]
pub struct InMemoryQueue {
    pending: Mutex<VecDeque<InboundMessage>>,
    completed: Mutex<Vec<InboundMessage>>,
    dead_lettered: Mutex<Vec<(InboundMessage, String)>>,
    arrivals: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, channel: Channel, routing_key: &str, payload: impl Into<String>) -> Uuid {
        let message = InboundMessage {
            id: Uuid::new_v4(),
            channel,
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            delivery_count: 1,
            receipt: None,
        };
        let id = message.id;
        self.pending.lock().await.push_back(message);
        self.arrivals.notify_one();
        id
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn completed(&self) -> Vec<InboundMessage> {
        self.completed.lock().await.clone()
    }

    pub async fn dead_lettered(&self) -> Vec<(InboundMessage, String)> {
        self.dead_lettered.lock().await.clone()
    }
}

#[async_trait]
impl MessageSource for InMemoryQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<InboundMessage>, WorkerError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(message) = self.pending.lock().await.pop_front() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, self.arrivals.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), WorkerError> {
        self.completed.lock().await.push(message.clone());
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), WorkerError> {
        let mut redelivery = message.clone();
        redelivery.delivery_count += 1;
        self.pending.lock().await.push_back(redelivery);
        self.arrivals.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, message: &InboundMessage, reason: &str) -> Result<(), WorkerError> {
        self.dead_lettered
            .lock()
            .await
            .push((message.clone(), reason.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        let queue = InMemoryQueue::new();
        let received = queue.receive(Duration::from_millis(10)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_abandon_redelivers_with_higher_count() {
        let queue = InMemoryQueue::new();
        queue.enqueue(Channel::Queue, "booking.confirmed", "{}").await;

        let first = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        queue.abandon(&first).await.unwrap();

        let second = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(InMemoryQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(Channel::Topic, "booking.cancelled", "{}").await;
        });

        let received = queue.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.map(|m| m.channel), Some(Channel::Topic));
    }
}
