use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::commands::BookingCommand;
use super::errors::BookingError;
use super::events::*;
use super::value_objects::{BookingStatus, TimeSlot};
use crate::event_sourcing::core::{Aggregate, EventMigrator, UpcastingMigrator};

// ============================================================================
// Booking Aggregate - Domain Logic
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct BookingAggregate {
    /// `None` until the booking has been requested
    pub status: Option<BookingStatus>,

    pub car_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub slot: Option<TimeSlot>,
    pub pickup_location: Option<String>,
    pub notes: Option<String>,

    pub price_cents: i64,
    pub payment_attempts: u32,
    pub paid: bool,
}

impl BookingAggregate {
    fn require_open(&self) -> Result<BookingStatus, BookingError> {
        match self.status {
            None => Err(BookingError::NotRequested),
            Some(BookingStatus::Cancelled) => Err(BookingError::AlreadyCancelled),
            Some(status) => Ok(status),
        }
    }
}

// ============================================================================
// Aggregate Trait Implementation
// ============================================================================

impl Aggregate for BookingAggregate {
    const AGGREGATE_TYPE: &'static str = "Booking";

    type Event = BookingEvent;
    type Command = BookingCommand;
    type Error = BookingError;

    fn apply(&mut self, event: &BookingEvent) {
        match event {
            BookingEvent::Requested(e) => {
                self.status = Some(BookingStatus::Requested);
                self.car_id = Some(e.car_id);
                self.customer_id = Some(e.customer_id);
                self.slot = Some(e.slot.clone());
                self.pickup_location = e.pickup_location.clone();
            }
            BookingEvent::Confirmed(e) => {
                self.status = Some(BookingStatus::Confirmed);
                self.price_cents = e.price_cents;
            }
            BookingEvent::Rescheduled(e) => {
                if let Some(slot) = &e.slot {
                    self.slot = Some(slot.clone());
                }
                e.pickup_location.apply_to(&mut self.pickup_location);
                e.notes.apply_to(&mut self.notes);
            }
            BookingEvent::PaymentAttempted(e) => {
                self.payment_attempts = self.payment_attempts.max(e.attempt_number);
                self.paid |= e.succeeded;
            }
            BookingEvent::Cancelled(_) => {
                self.status = Some(BookingStatus::Cancelled);
            }
        }
    }

    fn handle_command(&self, command: &BookingCommand) -> Result<Vec<BookingEvent>, BookingError> {
        match command {
            BookingCommand::RequestBooking {
                car_id,
                customer_id,
                slot,
                pickup_location,
            } => {
                if self.status.is_some() {
                    return Err(BookingError::AlreadyRequested);
                }
                if !slot.is_valid() {
                    return Err(BookingError::InvalidSlot);
                }

                Ok(vec![BookingEvent::Requested(BookingRequested {
                    car_id: *car_id,
                    customer_id: *customer_id,
                    slot: slot.clone(),
                    pickup_location: pickup_location.clone(),
                })])
            }

            BookingCommand::ConfirmBooking { price_cents } => {
                match self.require_open()? {
                    BookingStatus::Requested => {}
                    BookingStatus::Confirmed => return Err(BookingError::AlreadyConfirmed),
                    status => return Err(BookingError::InvalidStatusTransition(status)),
                }
                if *price_cents <= 0 {
                    return Err(BookingError::InvalidPrice(*price_cents));
                }

                Ok(vec![BookingEvent::Confirmed(BookingConfirmed {
                    price_cents: *price_cents,
                    confirmed_at: Utc::now(),
                })])
            }

            BookingCommand::Reschedule {
                slot,
                pickup_location,
                notes,
            } => {
                self.require_open()?;
                if slot.is_none() && pickup_location.is_unchanged() && notes.is_unchanged() {
                    return Err(BookingError::EmptyReschedule);
                }
                if slot.as_ref().is_some_and(|s| !s.is_valid()) {
                    return Err(BookingError::InvalidSlot);
                }

                Ok(vec![BookingEvent::Rescheduled(BookingRescheduled {
                    slot: slot.clone(),
                    pickup_location: pickup_location.clone(),
                    notes: notes.clone(),
                })])
            }

            BookingCommand::RecordPaymentAttempt {
                succeeded,
                amount_cents,
            } => {
                match self.require_open()? {
                    BookingStatus::Confirmed => {}
                    _ => return Err(BookingError::NotConfirmed),
                }
                if self.paid {
                    return Err(BookingError::AlreadyPaid);
                }

                Ok(vec![BookingEvent::PaymentAttempted(PaymentAttempted {
                    attempt_number: self.payment_attempts + 1,
                    succeeded: *succeeded,
                    amount_cents: *amount_cents,
                })])
            }

            BookingCommand::CancelBooking { reason } => {
                self.require_open()?;

                Ok(vec![BookingEvent::Cancelled(BookingCancelled {
                    reason: reason.clone(),
                    cancelled_at: Utc::now(),
                })])
            }
        }
    }

    fn migrator() -> Arc<dyn EventMigrator<BookingEvent>> {
        Arc::new(UpcastingMigrator::new().with_upcaster(PaymentAttemptedV1ToV2))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::booking::value_objects::FieldUpdate;
    use crate::event_sourcing::core::{EventMetadata, EventStreamChangeEvent};
    use chrono::Duration;

    fn slot() -> TimeSlot {
        let start = Utc::now() + Duration::days(1);
        TimeSlot::new(start, start + Duration::hours(4))
    }

    fn request() -> BookingCommand {
        BookingCommand::RequestBooking {
            car_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            slot: slot(),
            pickup_location: Some("Terminal 2".to_string()),
        }
    }

    fn run(booking: &mut BookingAggregate, command: BookingCommand) -> Result<Vec<BookingEvent>, BookingError> {
        let events = booking.handle_command(&command)?;
        for event in &events {
            booking.apply(event);
        }
        Ok(events)
    }

    #[test]
    fn test_request_then_confirm() {
        let mut booking = BookingAggregate::default();

        run(&mut booking, request()).unwrap();
        assert_eq!(booking.status, Some(BookingStatus::Requested));

        run(&mut booking, BookingCommand::ConfirmBooking { price_cents: 12_000 }).unwrap();
        assert_eq!(booking.status, Some(BookingStatus::Confirmed));
        assert_eq!(booking.price_cents, 12_000);
    }

    #[test]
    fn test_request_twice_fails() {
        let mut booking = BookingAggregate::default();
        run(&mut booking, request()).unwrap();

        assert!(matches!(run(&mut booking, request()), Err(BookingError::AlreadyRequested)));
    }

    #[test]
    fn test_invalid_slot_rejected() {
        let now = Utc::now();
        let command = BookingCommand::RequestBooking {
            car_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            slot: TimeSlot::new(now, now - Duration::hours(1)),
            pickup_location: None,
        };

        let result = BookingAggregate::default().handle_command(&command);
        assert!(matches!(result, Err(BookingError::InvalidSlot)));
    }

    #[test]
    fn test_confirm_before_request_fails() {
        let result = BookingAggregate::default().handle_command(&BookingCommand::ConfirmBooking { price_cents: 1 });
        assert!(matches!(result, Err(BookingError::NotRequested)));
    }

    #[test]
    fn test_cannot_modify_cancelled_booking() {
        let mut booking = BookingAggregate::default();
        run(&mut booking, request()).unwrap();
        run(&mut booking, BookingCommand::CancelBooking { reason: None }).unwrap();

        let confirm = run(&mut booking, BookingCommand::ConfirmBooking { price_cents: 100 });
        assert!(matches!(confirm, Err(BookingError::AlreadyCancelled)));

        let cancel = run(&mut booking, BookingCommand::CancelBooking { reason: None });
        assert!(matches!(cancel, Err(BookingError::AlreadyCancelled)));
    }

    #[test]
    fn test_reschedule_clears_and_keeps_fields() {
        let mut booking = BookingAggregate::default();
        run(&mut booking, request()).unwrap();
        run(
            &mut booking,
            BookingCommand::Reschedule {
                slot: None,
                pickup_location: FieldUpdate::Unchanged,
                notes: FieldUpdate::Set("late arrival".to_string()),
            },
        )
        .unwrap();
        run(
            &mut booking,
            BookingCommand::Reschedule {
                slot: None,
                pickup_location: FieldUpdate::Clear,
                notes: FieldUpdate::Unchanged,
            },
        )
        .unwrap();

        assert_eq!(booking.pickup_location, None);
        assert_eq!(booking.notes.as_deref(), Some("late arrival"));
    }

    #[test]
    fn test_empty_reschedule_rejected() {
        let mut booking = BookingAggregate::default();
        run(&mut booking, request()).unwrap();

        let result = run(
            &mut booking,
            BookingCommand::Reschedule {
                slot: None,
                pickup_location: FieldUpdate::Unchanged,
                notes: FieldUpdate::Unchanged,
            },
        );
        assert!(matches!(result, Err(BookingError::EmptyReschedule)));
    }

    #[test]
    fn test_payment_attempts_are_numbered() {
        let mut booking = BookingAggregate::default();
        run(&mut booking, request()).unwrap();

        let early = run(
            &mut booking,
            BookingCommand::RecordPaymentAttempt {
                succeeded: true,
                amount_cents: 100,
            },
        );
        assert!(matches!(early, Err(BookingError::NotConfirmed)));

        run(&mut booking, BookingCommand::ConfirmBooking { price_cents: 9_900 }).unwrap();
        let first = run(
            &mut booking,
            BookingCommand::RecordPaymentAttempt {
                succeeded: false,
                amount_cents: 9_900,
            },
        )
        .unwrap();
        let second = run(
            &mut booking,
            BookingCommand::RecordPaymentAttempt {
                succeeded: true,
                amount_cents: 9_900,
            },
        )
        .unwrap();

        assert!(matches!(&first[0], BookingEvent::PaymentAttempted(p) if p.attempt_number == 1));
        assert!(matches!(&second[0], BookingEvent::PaymentAttempted(p) if p.attempt_number == 2));
        assert!(booking.paid);

        let again = run(
            &mut booking,
            BookingCommand::RecordPaymentAttempt {
                succeeded: true,
                amount_cents: 9_900,
            },
        );
        assert!(matches!(again, Err(BookingError::AlreadyPaid)));
    }

    #[test]
    fn test_migrator_resolves_v1_payment() {
        let aggregate_id = Uuid::new_v4();
        let change = EventStreamChangeEvent {
            id: Uuid::new_v4(),
            stream_name: BookingAggregate::stream_name(aggregate_id),
            version: 4,
            payload: r#"{"type":"PaymentAttempted","data":{"attempt":2,"success":false}}"#.to_string(),
            metadata: EventMetadata {
                event_type: BOOKING_PAYMENT_ATTEMPTED.to_string(),
                type_name: "BookingEvent".to_string(),
                schema_version: 1,
                aggregate_id,
                correlation_id: Uuid::new_v4(),
                causation_id: None,
                occurred_at: Utc::now(),
            },
            entity_type: BookingAggregate::AGGREGATE_TYPE.to_string(),
            persisted_at: Utc::now(),
        };

        let event = BookingAggregate::migrator().resolve(&change).unwrap();
        assert!(matches!(
            event,
            BookingEvent::PaymentAttempted(PaymentAttempted {
                attempt_number: 2,
                succeeded: false,
                amount_cents: 0,
            })
        ));
    }
}
