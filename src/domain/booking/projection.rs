use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::events::*;
use super::value_objects::BookingStatus;
use crate::projection::{ReadModelProjector, ReadModelStore};

// ============================================================================
// Booking Summary - query-side view of one booking
// ============================================================================
//
// Status and slot are absolute: a handler only overwrites them when its
// event is at least as new as the last one applied. Payment counters
// merge by max / or, so a re-delivered attempt never double counts.
//
// ============================================================================

pub const BOOKING_SUMMARY_PROJECTOR: &str = "booking-summary";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingSummary {
    pub booking_id: Uuid,
    pub car_id: Uuid,
    pub customer_id: Uuid,
    pub status: BookingStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub pickup_location: Option<String>,
    pub price_cents: Option<i64>,
    pub payment_attempts: u32,
    pub paid: bool,
    pub cancel_reason: Option<String>,
    /// Highest stream version folded into this record
    pub last_version: i64,
}

impl BookingSummary {
    /// Claims `version` for an absolute update; `false` if a newer one already landed.
    fn advance_to(&mut self, version: i64) -> bool {
        if version < self.last_version {
            return false;
        }
        self.last_version = version;
        true
    }
}

pub fn booking_summary_projector(
    store: Arc<dyn ReadModelStore<BookingSummary>>,
) -> ReadModelProjector<BookingEvent, BookingSummary> {
    ReadModelProjector::<BookingEvent, BookingSummary>::new(BOOKING_SUMMARY_PROJECTOR, store)
        .on_create(BOOKING_REQUESTED, |env| match &env.event_data {
            BookingEvent::Requested(e) => Some(BookingSummary {
                booking_id: env.aggregate_id,
                car_id: e.car_id,
                customer_id: e.customer_id,
                status: BookingStatus::Requested,
                starts_at: e.slot.starts_at,
                ends_at: e.slot.ends_at,
                pickup_location: e.pickup_location.clone(),
                price_cents: None,
                payment_attempts: 0,
                paid: false,
                cancel_reason: None,
                last_version: env.sequence_number,
            }),
            _ => None,
        })
        .on_update(BOOKING_CONFIRMED, |env, row| {
            if let BookingEvent::Confirmed(e) = &env.event_data {
                if row.advance_to(env.sequence_number) && row.status != BookingStatus::Cancelled {
                    row.status = BookingStatus::Confirmed;
                }
                row.price_cents = Some(e.price_cents);
            }
        })
        .on_update(BOOKING_RESCHEDULED, |env, row| {
            if let BookingEvent::Rescheduled(e) = &env.event_data {
                if !row.advance_to(env.sequence_number) {
                    return;
                }
                if let Some(slot) = &e.slot {
                    row.starts_at = slot.starts_at;
                    row.ends_at = slot.ends_at;
                }
                e.pickup_location.apply_to(&mut row.pickup_location);
            }
        })
        .on_update(BOOKING_PAYMENT_ATTEMPTED, |env, row| {
            if let BookingEvent::PaymentAttempted(e) = &env.event_data {
                row.payment_attempts = row.payment_attempts.max(e.attempt_number);
                row.paid |= e.succeeded;
                row.last_version = row.last_version.max(env.sequence_number);
            }
        })
        .on_update(BOOKING_CANCELLED, |env, row| {
            if let BookingEvent::Cancelled(e) = &env.event_data {
                row.status = BookingStatus::Cancelled;
                row.cancel_reason = e.reason.clone();
                row.last_version = row.last_version.max(env.sequence_number);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::booking::value_objects::TimeSlot;
    use crate::event_sourcing::core::{DomainEvent, EventEnvelope};
    use crate::projection::{InMemoryReadModelStore, ProjectionOutcome};
    use chrono::Duration;

    fn envelope(booking_id: Uuid, version: i64, event: BookingEvent) -> EventEnvelope<BookingEvent> {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            aggregate_id: booking_id,
            stream_name: format!("booking-{booking_id}"),
            sequence_number: version,
            event_type: event.event_type().to_string(),
            event_version: 1,
            event_data: event,
            causation_id: None,
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            persisted_at: Utc::now(),
        }
    }

    fn requested() -> BookingEvent {
        let start = Utc::now();
        BookingEvent::Requested(BookingRequested {
            car_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            slot: TimeSlot::new(start, start + Duration::hours(2)),
            pickup_location: Some("Depot".to_string()),
        })
    }

    fn attempt(n: u32, succeeded: bool) -> BookingEvent {
        BookingEvent::PaymentAttempted(PaymentAttempted {
            attempt_number: n,
            succeeded,
            amount_cents: 2_500,
        })
    }

    #[tokio::test]
    async fn test_payment_attempts_merge_monotonically() {
        let store = Arc::new(InMemoryReadModelStore::<BookingSummary>::new());
        let projector = booking_summary_projector(store.clone());
        let id = Uuid::new_v4();

        projector.project(&envelope(id, 1, requested())).await.unwrap();
        projector.project(&envelope(id, 3, attempt(2, true))).await.unwrap();
        // re-delivery of an older attempt
        projector.project(&envelope(id, 2, attempt(1, false))).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.payment_attempts, 2);
        assert!(row.paid);
        assert_eq!(row.last_version, 3);
    }

    #[tokio::test]
    async fn test_duplicate_request_creates_one_summary() {
        let store = Arc::new(InMemoryReadModelStore::<BookingSummary>::new());
        let projector = booking_summary_projector(store.clone());
        let id = Uuid::new_v4();
        let event = requested();

        let first = projector.project(&envelope(id, 1, event.clone())).await.unwrap();
        let second = projector.project(&envelope(id, 1, event)).await.unwrap();

        assert_eq!(first, ProjectionOutcome::Applied);
        assert_eq!(second, ProjectionOutcome::AlreadyExists);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_confirm_does_not_revive_cancelled_booking() {
        let store = Arc::new(InMemoryReadModelStore::<BookingSummary>::new());
        let projector = booking_summary_projector(store.clone());
        let id = Uuid::new_v4();
        let confirmed = BookingEvent::Confirmed(BookingConfirmed {
            price_cents: 7_000,
            confirmed_at: Utc::now(),
        });

        projector.project(&envelope(id, 1, requested())).await.unwrap();
        projector.project(&envelope(id, 2, confirmed.clone())).await.unwrap();
        projector
            .project(&envelope(
                id,
                3,
                BookingEvent::Cancelled(BookingCancelled {
                    reason: Some("flight cancelled".to_string()),
                    cancelled_at: Utc::now(),
                }),
            ))
            .await
            .unwrap();
        projector.project(&envelope(id, 2, confirmed)).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, BookingStatus::Cancelled);
        assert_eq!(row.price_cents, Some(7_000));
        assert_eq!(row.cancel_reason.as_deref(), Some("flight cancelled"));
    }

    #[tokio::test]
    async fn test_update_before_request_is_skipped() {
        let store = Arc::new(InMemoryReadModelStore::<BookingSummary>::new());
        let projector = booking_summary_projector(store.clone());

        let outcome = projector
            .project(&envelope(Uuid::new_v4(), 2, attempt(1, true)))
            .await
            .unwrap();

        assert_eq!(outcome, ProjectionOutcome::MissingRecord);
        assert!(store.is_empty().await);
    }
}
