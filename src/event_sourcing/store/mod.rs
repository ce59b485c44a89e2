// ============================================================================
// Event Sourcing Store - Persistence Layer
// ============================================================================
//
// `EventStore` is the backend contract (in-memory, ScyllaDB);
// `AggregateCommandStore` sits on top and runs the save flow.
//
// ============================================================================

pub mod command_store;
pub mod event_store;
pub mod memory;
pub mod scylla_store;

pub use command_store::{AggregateCommandStore, SaveOutcome, SaveParticipant};
pub use event_store::{AppendOutcome, EventStore, StreamChanged};
pub use memory::InMemoryEventStore;
pub use scylla_store::{ScyllaEventStore, EVENT_STREAMS_TABLE};
