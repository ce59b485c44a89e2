// ============================================================================
// Event Sourcing Core - Generic Abstractions
// ============================================================================
//
// No domain code lives here; see src/domain/ for aggregates.
//
// ============================================================================

pub mod aggregate;
pub mod event;
pub mod migration;

pub use aggregate::{Aggregate, AggregateRoot};
pub use event::{
    deserialize_event, serialize_event, DomainEvent, EventEnvelope, EventMetadata, EventStreamChangeEvent, NewEvent,
};
pub use migration::{EventMigrator, EventUpcaster, UpcastingMigrator};
