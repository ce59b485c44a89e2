use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value_objects::{FieldUpdate, TimeSlot};
use crate::event_sourcing::core::{DomainEvent, EventUpcaster};

// ============================================================================
// Booking Events - Domain Events for Booking Aggregate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BookingEvent {
    Requested(BookingRequested),
    Confirmed(BookingConfirmed),
    Rescheduled(BookingRescheduled),
    PaymentAttempted(PaymentAttempted),
    Cancelled(BookingCancelled),
}

pub const BOOKING_REQUESTED: &str = "BookingRequested";
pub const BOOKING_CONFIRMED: &str = "BookingConfirmed";
pub const BOOKING_RESCHEDULED: &str = "BookingRescheduled";
pub const BOOKING_PAYMENT_ATTEMPTED: &str = "BookingPaymentAttempted";
pub const BOOKING_CANCELLED: &str = "BookingCancelled";

impl DomainEvent for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BookingEvent::Requested(_) => BOOKING_REQUESTED,
            BookingEvent::Confirmed(_) => BOOKING_CONFIRMED,
            BookingEvent::Rescheduled(_) => BOOKING_RESCHEDULED,
            BookingEvent::PaymentAttempted(_) => BOOKING_PAYMENT_ATTEMPTED,
            BookingEvent::Cancelled(_) => BOOKING_CANCELLED,
        }
    }

    fn schema_version(&self) -> i32 {
        match self {
            BookingEvent::PaymentAttempted(_) => 2,
            _ => 1,
        }
    }
}

// ============================================================================
// Individual Event Types
// ============================================================================

/// Booking Requested - Initial event in booking lifecycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BookingRequested {
    pub car_id: Uuid,
    pub customer_id: Uuid,
    pub slot: TimeSlot,
    pub pickup_location: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BookingConfirmed {
    pub price_cents: i64,
    pub confirmed_at: DateTime<Utc>,
}

/// Booking Rescheduled - partial update; untouched fields stay `Unchanged`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BookingRescheduled {
    pub slot: Option<TimeSlot>,
    #[serde(default)]
    pub pickup_location: FieldUpdate<String>,
    #[serde(default)]
    pub notes: FieldUpdate<String>,
}

/// Payment Attempted - schema v2 added `amount_cents` and renamed the v1 fields
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PaymentAttempted {
    pub attempt_number: u32,
    pub succeeded: bool,
    pub amount_cents: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BookingCancelled {
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

// ============================================================================
// Upcasters
// ============================================================================

/// v1 stored `{"attempt": n, "success": bool}` and no amount.
pub struct PaymentAttemptedV1ToV2;

impl EventUpcaster for PaymentAttemptedV1ToV2 {
    fn event_type(&self) -> &str {
        BOOKING_PAYMENT_ATTEMPTED
    }

    fn from_version(&self) -> i32 {
        1
    }

    fn upcast(&self, event_json: &str) -> anyhow::Result<String> {
        let mut value: serde_json::Value = serde_json::from_str(event_json)?;
        let data = value
            .get_mut("data")
            .and_then(|d| d.as_object_mut())
            .ok_or_else(|| anyhow::anyhow!("PaymentAttempted v1 payload has no data object"))?;

        let attempt = data
            .remove("attempt")
            .ok_or_else(|| anyhow::anyhow!("PaymentAttempted v1 payload has no attempt"))?;
        let success = data.remove("success").unwrap_or(serde_json::Value::Bool(false));

        data.insert("attempt_number".to_string(), attempt);
        data.insert("succeeded".to_string(), success);
        data.entry("amount_cents").or_insert(serde_json::json!(0));

        Ok(serde_json::to_string(&value)?)
    }
}
