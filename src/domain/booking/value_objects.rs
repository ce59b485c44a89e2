use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Booking Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Requested,
    Confirmed,
    Cancelled,
}

/// Rental window for one car.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TimeSlot {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl TimeSlot {
    pub fn new(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self { starts_at, ends_at }
    }

    pub fn is_valid(&self) -> bool {
        self.ends_at > self.starts_at
    }
}

/// Change to an optional field in a partial update.
///
/// `Option<Option<T>>` cannot tell "leave it" from "clear it" once it has
/// been through JSON, so the three cases are spelled out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(tag = "op", content = "value")]
pub enum FieldUpdate<T> {
    #[default]
    Unchanged,
    Clear,
    Set(T),
}

impl<T: Clone> FieldUpdate<T> {
    pub fn apply_to(&self, field: &mut Option<T>) {
        match self {
            FieldUpdate::Unchanged => {}
            FieldUpdate::Clear => *field = None,
            FieldUpdate::Set(value) => *field = Some(value.clone()),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, FieldUpdate::Unchanged)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
