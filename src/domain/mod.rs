// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Each aggregate has its own subdirectory with:
// - Value objects
// - Events (and their upcasters)
// - Commands
// - Errors
// - Aggregate implementation
// - Command handler
// - Read-side projection and integration contracts
//
// This layer only sees the event sourcing infrastructure through the
// Aggregate trait and the command store.
//
// ============================================================================

pub mod booking;
