// ============================================================================
// stream_relay
// ============================================================================
//
// Event-sourced aggregates with a notification relay on the write side:
//
//   command → aggregate → EventStore (per-stream CAS)
//           → ChangeNotificationAggregator (save participants)
//           → StreamOrderingHandler → consumers / projections / broker
//
// The broker side is drained by the CrossProcessRelayWorker, which forwards
// typed contracts to HTTP drain endpoints.
//
// ============================================================================

pub mod config;
pub mod domain;
pub mod errors;
pub mod event_sourcing;
pub mod messaging;
pub mod metrics;
pub mod notification;
pub mod projection;
pub mod relay;
pub mod telemetry;
pub mod utils;
pub mod worker;
