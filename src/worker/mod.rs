// ============================================================================
// Cross-Process Relay Worker
// ============================================================================
//
// Separate process: consumes broker traffic and calls back into other
// services' drain endpoints through statically typed pipelines.
//
// ============================================================================

pub mod dlq;
pub mod drain_client;
pub mod relay_worker;
pub mod routing;
pub mod source;

pub use dlq::{AddToDlq, DlqActor, DlqMessage, DlqMessages, DlqStats, GetDlqMessages, GetDlqStats};
pub use drain_client::{DrainCall, DrainClient, HttpDrainClient, InMemoryDrainClient};
pub use relay_worker::{CrossProcessRelayWorker, Disposition, DrainSummary};
pub use routing::{DeliveryPipeline, Destination, Route, RoutingTable};
pub use source::{BrokerReceipt, Channel, InMemoryQueue, InboundMessage, MessageSource};
