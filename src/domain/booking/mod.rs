// ============================================================================
// Booking Domain Module
// ============================================================================

pub mod aggregate;
pub mod command_handler;
pub mod commands;
pub mod contracts;
pub mod errors;
pub mod events;
pub mod projection;
pub mod value_objects;

pub use aggregate::*;
pub use command_handler::*;
pub use commands::*;
pub use contracts::*;
pub use errors::*;
pub use events::*;
pub use projection::*;
pub use value_objects::*;
