use chrono::{DateTime, Utc};
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::BookingEvent;
use crate::event_sourcing::core::EventEnvelope;
use crate::messaging::IntegrationEvent;
use crate::relay::IntegrationEventTranslator;
use crate::worker::{Channel, Destination, RoutingTable};

// ============================================================================
// Booking Integration Contracts
// ============================================================================
//
// What other services see of a booking. Contracts are versioned in their
// type name and never change shape; a new shape is a new contract.
//
// ============================================================================

pub const BOOKING_CONFIRMED_ROUTING_KEY: &str = "booking.confirmed";
pub const BOOKING_CANCELLED_ROUTING_KEY: &str = "booking.cancelled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BookingConfirmedV1 {
    pub booking_id: Uuid,
    pub price_cents: i64,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BookingCancelledV1 {
    pub booking_id: Uuid,
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

/// Publishes confirmations and cancellations; everything else stays internal.
pub struct BookingTranslator;

impl IntegrationEventTranslator<BookingEvent> for BookingTranslator {
    fn translate(&self, event: &EventEnvelope<BookingEvent>) -> Result<Option<IntegrationEvent>, serde_json::Error> {
        match &event.event_data {
            BookingEvent::Confirmed(e) => {
                let contract = BookingConfirmedV1 {
                    booking_id: event.aggregate_id,
                    price_cents: e.price_cents,
                    confirmed_at: e.confirmed_at,
                };
                IntegrationEvent::from_envelope(BOOKING_CONFIRMED_ROUTING_KEY, event, &contract).map(Some)
            }
            BookingEvent::Cancelled(e) => {
                let contract = BookingCancelledV1 {
                    booking_id: event.aggregate_id,
                    reason: e.reason.clone(),
                    cancelled_at: e.cancelled_at,
                };
                IntegrationEvent::from_envelope(BOOKING_CANCELLED_ROUTING_KEY, event, &contract).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// Broker channel per routing key; anything unlisted is a topic.
pub fn booking_channels() -> HashMap<String, Channel> {
    HashMap::from([(BOOKING_CONFIRMED_ROUTING_KEY.to_string(), Channel::Queue)])
}

/// Confirmations are work for billing alone; cancellations fan out to
/// billing and fleet.
pub fn booking_routes(billing: Destination, fleet: Destination) -> RoutingTable {
    RoutingTable::new()
        .queue::<BookingConfirmedV1>(BOOKING_CONFIRMED_ROUTING_KEY, billing.clone())
        .subscribe::<BookingCancelledV1>(BOOKING_CANCELLED_ROUTING_KEY, billing)
        .subscribe::<BookingCancelledV1>(BOOKING_CANCELLED_ROUTING_KEY, fleet)
}
