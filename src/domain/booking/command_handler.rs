use std::sync::Arc;
use uuid::Uuid;

use super::aggregate::BookingAggregate;
use super::commands::BookingCommand;
use crate::errors::SaveError;
use crate::event_sourcing::store::{AggregateCommandStore, SaveOutcome};

// ============================================================================
// Booking Command Handler
// ============================================================================
//
// Orchestrates: Command → Aggregate → Events → Event Store → Participants
//
// ============================================================================

pub struct BookingCommandHandler {
    store: Arc<AggregateCommandStore>,
}

impl BookingCommandHandler {
    pub fn new(store: Arc<AggregateCommandStore>) -> Self {
        Self { store }
    }

    /// Handle a command and persist resulting events
    pub async fn handle(
        &self,
        booking_id: Uuid,
        command: BookingCommand,
        correlation_id: Uuid,
    ) -> Result<SaveOutcome, SaveError> {
        let command_name = command_name(&command);
        let outcome = self
            .store
            .execute::<BookingAggregate>(booking_id, command, correlation_id)
            .await?;

        tracing::info!(
            booking_id = %booking_id,
            command = command_name,
            new_version = outcome.new_version,
            "✅ Booking command handled"
        );
        Ok(outcome)
    }

    /// Retry once on a concurrency conflict; the command is re-validated
    /// against the reloaded state.
    pub async fn handle_with_retry(
        &self,
        booking_id: Uuid,
        command: BookingCommand,
        correlation_id: Uuid,
    ) -> Result<SaveOutcome, SaveError> {
        match self.handle(booking_id, command.clone(), correlation_id).await {
            Err(e) if e.is_conflict() => {
                tracing::warn!(booking_id = %booking_id, "🔄 Concurrency conflict, retrying booking command");
                self.handle(booking_id, command, correlation_id).await
            }
            other => other,
        }
    }
}

fn command_name(command: &BookingCommand) -> &'static str {
    match command {
        BookingCommand::RequestBooking { .. } => "RequestBooking",
        BookingCommand::ConfirmBooking { .. } => "ConfirmBooking",
        BookingCommand::Reschedule { .. } => "Reschedule",
        BookingCommand::RecordPaymentAttempt { .. } => "RecordPaymentAttempt",
        BookingCommand::CancelBooking { .. } => "CancelBooking",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::booking::value_objects::{BookingStatus, TimeSlot};
    use crate::event_sourcing::store::InMemoryEventStore;
    use chrono::{Duration, Utc};

    fn handler() -> (BookingCommandHandler, Arc<AggregateCommandStore>) {
        let store = Arc::new(AggregateCommandStore::new(Arc::new(InMemoryEventStore::default())));
        (BookingCommandHandler::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_handle_persists_and_reloads() {
        let (handler, store) = handler();
        let booking_id = Uuid::new_v4();
        let start = Utc::now();

        handler
            .handle(
                booking_id,
                BookingCommand::RequestBooking {
                    car_id: Uuid::new_v4(),
                    customer_id: Uuid::new_v4(),
                    slot: TimeSlot::new(start, start + Duration::hours(3)),
                    pickup_location: None,
                },
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        let outcome = handler
            .handle(booking_id, BookingCommand::ConfirmBooking { price_cents: 5_000 }, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(outcome.new_version, 2);
        let root = store.load::<BookingAggregate>(booking_id).await.unwrap();
        assert_eq!(root.version(), 2);
        assert_eq!(root.state().status, Some(BookingStatus::Confirmed));
    }

    #[tokio::test]
    async fn test_rejected_command_writes_nothing() {
        let (handler, store) = handler();
        let booking_id = Uuid::new_v4();

        let result = handler
            .handle(booking_id, BookingCommand::CancelBooking { reason: None }, Uuid::new_v4())
            .await;

        assert!(matches!(result, Err(SaveError::Rejected(_))));
        let root = store.load::<BookingAggregate>(booking_id).await.unwrap();
        assert_eq!(root.version(), 0);
    }
}
