use uuid::Uuid;

use super::value_objects::{FieldUpdate, TimeSlot};

// ============================================================================
// Booking Commands
// ============================================================================

#[derive(Debug, Clone)]
pub enum BookingCommand {
    RequestBooking {
        car_id: Uuid,
        customer_id: Uuid,
        slot: TimeSlot,
        pickup_location: Option<String>,
    },
    ConfirmBooking {
        price_cents: i64,
    },
    Reschedule {
        slot: Option<TimeSlot>,
        pickup_location: FieldUpdate<String>,
        notes: FieldUpdate<String>,
    },
    RecordPaymentAttempt {
        succeeded: bool,
        amount_cents: i64,
    },
    CancelBooking {
        reason: Option<String>,
    },
}
