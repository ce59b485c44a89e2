use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::Channel;
use crate::errors::WorkerError;

/// A drain endpoint owned by another service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub drain_url: String,
    /// Sent as a bearer token on every drain call
    pub shared_secret: String,
}

impl Destination {
    pub fn new(name: &str, drain_url: &str, shared_secret: &str) -> Self {
        Self {
            name: name.to_string(),
            drain_url: drain_url.to_string(),
            shared_secret: shared_secret.to_string(),
        }
    }
}

type Decoder = Arc<dyn Fn(&str) -> Result<serde_json::Value, serde_json::Error> + Send + Sync>;

/// Checks an inbound payload against its statically known contract type and
/// re-encodes it as the body of the drain call.
#[derive(Clone)]
pub struct DeliveryPipeline {
    contract: &'static str,
    decode: Decoder,
}

impl DeliveryPipeline {
    pub fn typed<T>() -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        Self {
            contract: std::any::type_name::<T>(),
            decode: Arc::new(|payload| {
                let typed: T = serde_json::from_str(payload)?;
                serde_json::to_value(&typed)
            }),
        }
    }

    pub fn contract(&self) -> &'static str {
        self.contract
    }

    pub fn prepare(&self, routing_key: &str, payload: &str) -> Result<serde_json::Value, WorkerError> {
        (self.decode)(payload).map_err(|source| WorkerError::Payload {
            routing_key: routing_key.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline").field("contract", &self.contract).finish()
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub pipeline: DeliveryPipeline,
    pub destinations: Vec<Destination>,
}

/// Routing key → pipeline, one table per channel.
///
/// A queue route has exactly one destination; a topic route fans out to
/// every destination subscribed to it.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    queues: HashMap<String, Route>,
    topics: HashMap<String, Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route queue messages for `routing_key` to `destination`, replacing any
    /// earlier queue route for that key.
    pub fn queue<T>(mut self, routing_key: &str, destination: Destination) -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.queues.insert(
            routing_key.to_string(),
            Route {
                pipeline: DeliveryPipeline::typed::<T>(),
                destinations: vec![destination],
            },
        );
        self
    }

    /// Add `destination` as a subscriber of topic messages for `routing_key`.
    pub fn subscribe<T>(mut self, routing_key: &str, destination: Destination) -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.topics
            .entry(routing_key.to_string())
            .or_insert_with(|| Route {
                pipeline: DeliveryPipeline::typed::<T>(),
                destinations: Vec::new(),
            })
            .destinations
            .push(destination);
        self
    }

    pub fn resolve(&self, channel: Channel, routing_key: &str) -> Result<&Route, WorkerError> {
        let table = match channel {
            Channel::Queue => &self.queues,
            Channel::Topic => &self.topics,
        };
        table
            .get(routing_key)
            .ok_or_else(|| WorkerError::UnknownRoute(routing_key.to_string()))
    }

    /// Every distinct destination across both tables.
    pub fn destinations(&self) -> Vec<&Destination> {
        let mut seen = HashMap::new();
        for route in self.queues.values().chain(self.topics.values()) {
            for destination in &route.destinations {
                seen.entry(destination.name.as_str()).or_insert(destination);
            }
        }
        seen.into_values().collect()
    }
}
