use thiserror::Error;

use crate::utils::IsTransient;

// ============================================================================
// Error Taxonomy
// ============================================================================
//
// One enum per boundary:
// - StoreError        → EventStore / AggregateCommandStore
// - NotificationError → post-save obligations, relays, projections
// - SaveError         → what a caller of `save` / `execute` sees
// - BrokerError       → integration event publishing
// - WorkerError       → cross-process relay worker
//
// "Unhandled event type" is not an error variant: it is reported as
// `applied = false` / `RelayOutcome::Unregistered`, never as an error.
//
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// Stored version differs from the caller's expected version.
    /// Retryable: reload the aggregate and reapply the command.
    #[error("Concurrency conflict on stream '{stream}': expected version {expected}, but current is {actual}")]
    ConcurrencyConflict {
        stream: String,
        expected: i64,
        actual: i64,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend unreachable or timed out; safe to retry.
    #[error("Storage backend unavailable: {0}")]
    Transient(String),

    #[error(transparent)]
    Defect(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::Transient(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Consumer '{consumer}' failed on {stream}@{version}: {message}")]
    Consumer {
        consumer: String,
        stream: String,
        version: i64,
        message: String,
    },

    #[error("Cannot resolve event '{event_type}' on {stream}@{version}: {message}")]
    Resolution {
        stream: String,
        version: i64,
        event_type: String,
        message: String,
    },

    #[error("Projection '{projection}' failed on {stream}@{version}: {message}")]
    Projection {
        projection: String,
        stream: String,
        version: i64,
        message: String,
    },

    #[error("Integration event publish failed for {stream}@{version}: {source}")]
    Publish {
        stream: String,
        version: i64,
        #[source]
        source: BrokerError,
    },

    #[error("Batch handler for stream '{stream}' panicked: {message}")]
    HandlerPanicked { stream: String, message: String },

    #[error("Notification processing cancelled")]
    Cancelled,
}

impl NotificationError {
    /// Stream and version the failure is attached to, when there is one.
    pub fn position(&self) -> Option<(&str, i64)> {
        match self {
            NotificationError::Consumer { stream, version, .. }
            | NotificationError::Resolution { stream, version, .. }
            | NotificationError::Projection { stream, version, .. }
            | NotificationError::Publish { stream, version, .. } => Some((stream, *version)),
            NotificationError::HandlerPanicked { .. } | NotificationError::Cancelled => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// ValidationFailure: the aggregate refused the command, nothing was written.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// The events ARE durably persisted; only post-save side effects failed.
    /// Callers must treat this as "state changed, re-drain required".
    #[error("Events persisted up to version {new_version} but side effects failed: {source}")]
    SideEffects {
        new_version: i64,
        #[source]
        source: NotificationError,
    },
}

impl SaveError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SaveError::Store(e) if e.is_conflict())
    }

    /// True when the store accepted the write despite the reported failure.
    pub fn is_committed(&self) -> bool {
        matches!(self, SaveError::SideEffects { .. })
    }
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Transient(String),

    #[error("Broker rejected message: {0}")]
    Rejected(String),
}

impl IsTransient for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No route for routing key '{0}'")]
    UnknownRoute(String),

    #[error("Payload for '{routing_key}' does not match its contract: {source}")]
    Payload {
        routing_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Destination '{destination}' answered HTTP {status}")]
    Http { destination: String, status: u16 },

    #[error("Transport error calling '{destination}': {message}")]
    Transport { destination: String, message: String },

    #[error("Circuit breaker open for destination '{0}'")]
    CircuitOpen(String),

    #[error("Message source error: {0}")]
    Source(String),
}

impl IsTransient for WorkerError {
    fn is_transient(&self) -> bool {
        match self {
            WorkerError::UnknownRoute(_) | WorkerError::Payload { .. } => false,
            // 4xx other than throttling means the drain refused the payload itself
            WorkerError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            WorkerError::Transport { .. } | WorkerError::CircuitOpen(_) | WorkerError::Source(_) => true,
        }
    }
}
