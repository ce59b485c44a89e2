use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::utils::{CircuitBreakerConfig, RetryConfig};

// ============================================================================
// Configuration
// ============================================================================
//
// Plain structs with defaults that match a local docker-compose setup
// (ScyllaDB on 9042, Redpanda on 9092). `from_env()` overlays
// `STREAM_RELAY_*` variables; anything unset or unparsable keeps its default.
//
// ============================================================================

const ENV_PREFIX: &str = "STREAM_RELAY_";

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Some(raw) = env_var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(variable = %format!("{ENV_PREFIX}{name}"), value = %raw, "Ignoring unparsable setting"),
        }
    }
}

fn env_list(name: &str, target: &mut Vec<String>) {
    if let Some(raw) = env_var(name) {
        *target = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Scylla,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "scylla" => Ok(StoreBackend::Scylla),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub scylla_node: String,
    pub keyspace: String,
    /// Capacity of the in-process "stream changed" broadcast channel
    pub notification_capacity: usize,
    /// Also feed the observer relay from the table's CDC log (scylla only)
    pub change_feed: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            scylla_node: "127.0.0.1:9042".to_string(),
            keyspace: "stream_relay".to_string(),
            notification_capacity: 1024,
            change_feed: false,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_parse("STORE_BACKEND", &mut config.backend);
        env_parse("SCYLLA_NODE", &mut config.scylla_node);
        env_parse("KEYSPACE", &mut config.keyspace);
        env_parse("NOTIFICATION_CAPACITY", &mut config.notification_capacity);
        env_parse("CHANGE_FEED", &mut config.change_feed);
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub broker_servers: String,
    pub publish_max_attempts: u32,
    pub publish_initial_delay_ms: u64,
    pub publish_max_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker_servers: "127.0.0.1:9092".to_string(),
            publish_max_attempts: 5,
            publish_initial_delay_ms: 50,
            publish_max_delay_ms: 5_000,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_parse("BROKER_SERVERS", &mut config.broker_servers);
        env_parse("PUBLISH_MAX_ATTEMPTS", &mut config.publish_max_attempts);
        env_parse("PUBLISH_INITIAL_DELAY_MS", &mut config.publish_initial_delay_ms);
        env_parse("PUBLISH_MAX_DELAY_MS", &mut config.publish_max_delay_ms);
        config
    }

    pub fn publish_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.publish_max_attempts.max(1),
            initial_delay: Duration::from_millis(self.publish_initial_delay_ms),
            max_delay: Duration::from_millis(self.publish_max_delay_ms),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub broker_servers: String,
    pub consumer_group: String,
    /// Point-to-point queues; each message goes to exactly one destination
    pub queue_topics: Vec<String>,
    /// Pub/sub topics; each message fans out to every subscribed destination
    pub bus_topics: Vec<String>,
    pub metrics_port: u16,
    pub max_delivery_attempts: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_open_secs: u64,
    pub breaker_success_threshold: u32,
    /// Pause after abandoning a message to an open breaker
    pub abandon_backoff_ms: u64,
    pub receive_timeout_ms: u64,
    pub drain_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_servers: "127.0.0.1:9092".to_string(),
            consumer_group: "stream-relay-worker".to_string(),
            queue_topics: vec!["booking-queue".to_string()],
            bus_topics: vec!["booking-events".to_string()],
            metrics_port: 9090,
            max_delivery_attempts: 5,
            breaker_failure_threshold: 5,
            breaker_open_secs: 30,
            breaker_success_threshold: 2,
            abandon_backoff_ms: 1_000,
            receive_timeout_ms: 500,
            drain_timeout_secs: 10,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_parse("BROKER_SERVERS", &mut config.broker_servers);
        env_parse("CONSUMER_GROUP", &mut config.consumer_group);
        env_list("QUEUE_TOPICS", &mut config.queue_topics);
        env_list("BUS_TOPICS", &mut config.bus_topics);
        env_parse("METRICS_PORT", &mut config.metrics_port);
        env_parse("MAX_DELIVERY_ATTEMPTS", &mut config.max_delivery_attempts);
        env_parse("BREAKER_FAILURE_THRESHOLD", &mut config.breaker_failure_threshold);
        env_parse("BREAKER_OPEN_SECS", &mut config.breaker_open_secs);
        env_parse("BREAKER_SUCCESS_THRESHOLD", &mut config.breaker_success_threshold);
        env_parse("ABANDON_BACKOFF_MS", &mut config.abandon_backoff_ms);
        env_parse("RECEIVE_TIMEOUT_MS", &mut config.receive_timeout_ms);
        env_parse("DRAIN_TIMEOUT_SECS", &mut config.drain_timeout_secs);
        config
    }

    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            timeout: Duration::from_secs(self.breaker_open_secs),
            success_threshold: self.breaker_success_threshold,
        }
    }

    pub fn abandon_backoff(&self) -> Duration {
        Duration::from_millis(self.abandon_backoff_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Where a worker destination's drain endpoint lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainEndpoint {
    pub name: String,
    pub url: String,
    pub shared_secret: String,
}

impl DrainEndpoint {
    /// Reads `STREAM_RELAY_<NAME>_DRAIN_URL` and `STREAM_RELAY_<NAME>_DRAIN_SECRET`.
    pub fn from_env(name: &str, default_url: &str) -> Self {
        let prefix = name.to_ascii_uppercase();
        let mut endpoint = Self {
            name: name.to_string(),
            url: default_url.to_string(),
            shared_secret: String::new(),
        };
        env_parse(&format!("{prefix}_DRAIN_URL"), &mut endpoint.url);
        env_parse(&format!("{prefix}_DRAIN_SECRET"), &mut endpoint.shared_secret);
        if endpoint.shared_secret.is_empty() {
            tracing::warn!(destination = %name, "No drain secret configured");
        }
        endpoint
    }
}
