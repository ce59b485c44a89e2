use super::value_objects::BookingStatus;

// ============================================================================
// Booking Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Booking has already been requested")]
    AlreadyRequested,

    #[error("Booking has not been requested")]
    NotRequested,

    #[error("Booking is already confirmed")]
    AlreadyConfirmed,

    #[error("Booking is already cancelled")]
    AlreadyCancelled,

    #[error("Booking must be confirmed before payment")]
    NotConfirmed,

    #[error("Booking is already paid")]
    AlreadyPaid,

    #[error("Time slot must end after it starts")]
    InvalidSlot,

    #[error("Invalid price: {0} cents")]
    InvalidPrice(i64),

    #[error("Reschedule changes nothing")]
    EmptyReschedule,

    #[error("Cannot modify booking in status: {0:?}")]
    InvalidStatusTransition(BookingStatus),
}
