// ============================================================================
// Notification Relay
// ============================================================================
//
// Routes persisted events to in-process consumers and, via a translator, to
// the external broker. Two variants share one registry:
//
// - SynchronousRelay: enlisted in the save; the caller waits
// - ObserverRelay:    kameo actor fed by the store's stream-changed signal
//                     (or the CDC change feed); runs after the save returns
//
// ============================================================================

pub mod async_relay;
pub mod cdc_feed;
pub mod publisher;
pub mod registry;
pub mod sync_relay;

pub use async_relay::{
    FailedDeliveries, FailedDelivery, FailureKind, GetFailedDeliveries, GetRelayStats, NotificationsLost,
    ObserverRelay, Redrain, RedrainOutcome, RelayStats,
};
pub use cdc_feed::CdcChangeFeed;
pub use publisher::IntegrationPublisher;
pub use registry::{
    DomainEventConsumer, IntegrationEventTranslator, Registration, RegistryBatchHandler, RelayOutcome, RelayRegistry,
    RelayRegistryBuilder,
};
pub use sync_relay::SynchronousRelay;
