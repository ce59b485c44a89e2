use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::Destination;
use crate::errors::WorkerError;

pub const ROUTING_KEY_HEADER: &str = "X-Routing-Key";

/// Outbound call to a destination's drain endpoint.
#[async_trait]
pub trait DrainClient: Send + Sync {
    async fn deliver(
        &self,
        destination: &Destination,
        routing_key: &str,
        body: &serde_json::Value,
    ) -> Result<(), WorkerError>;
}

/// Authenticated JSON POST over HTTP.
pub struct HttpDrainClient {
    client: reqwest::Client,
}

impl HttpDrainClient {
    pub fn new(timeout: Duration) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Transport {
                destination: "*".to_string(),
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DrainClient for HttpDrainClient {
    async fn deliver(
        &self,
        destination: &Destination,
        routing_key: &str,
        body: &serde_json::Value,
    ) -> Result<(), WorkerError> {
        let response = self
            .client
            .post(&destination.drain_url)
            .bearer_auth(&destination.shared_secret)
            .header(ROUTING_KEY_HEADER, routing_key)
            .json(body)
            .send()
            .await
            .map_err(|e| WorkerError::Transport {
                destination: destination.name.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WorkerError::Http {
                destination: destination.name.clone(),
                status: status.as_u16(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainCall {
    pub destination: String,
    pub routing_key: String,
    pub body: serde_json::Value,
}

/// Records drain calls in memory; destinations can be told to answer with
/// an HTTP error status for their next calls.
#[derive(Default)]
pub struct InMemoryDrainClient {
    delivered: Mutex<Vec<DrainCall>>,
    failing: Mutex<HashMap<String, (u32, u16)>>,
}

impl InMemoryDrainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next(&self, destination: &str, calls: u32, status: u16) {
        self.failing
            .lock()
            .await
            .insert(destination.to_string(), (calls, status));
    }

    pub async fn delivered(&self) -> Vec<DrainCall> {
        self.delivered.lock().await.clone()
    }

    pub async fn delivered_to(&self, destination: &str) -> Vec<DrainCall> {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|call| call.destination == destination)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DrainClient for InMemoryDrainClient {
    async fn deliver(
        &self,
        destination: &Destination,
        routing_key: &str,
        body: &serde_json::Value,
    ) -> Result<(), WorkerError> {
        {
            let mut failing = self.failing.lock().await;
            if let Some((remaining, status)) = failing.get_mut(&destination.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(WorkerError::Http {
                        destination: destination.name.clone(),
                        status: *status,
                    });
                }
            }
        }

        self.delivered.lock().await.push(DrainCall {
            destination: destination.name.clone(),
            routing_key: routing_key.to_string(),
            body: body.clone(),
        });
        Ok(())
    }
}
