// ============================================================================
// Read-side projections
// ============================================================================

pub mod projector;
pub mod store;

pub use projector::{ProjectionOutcome, ProjectionParticipant, ReadModelProjector};
pub use store::{InMemoryReadModelStore, ReadModelStore};
