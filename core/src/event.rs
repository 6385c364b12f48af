//! Booking domain events.
//!
//! Events represent facts about bookings that already happened. Each variant
//! carries a [`BookingSnapshot`] copied at the moment the event was raised, so
//! later changes to the booking never leak into an event already in flight.
//!
//! # Example
//!
//! ```
//! use booking_relay_core::event::{BookingEvent, BookingSnapshot, Event};
//!
//! let snapshot = BookingSnapshot::example("C1", "S1");
//! let event = BookingEvent::Created(snapshot);
//! assert_eq!(event.event_type(), "BookingCreated");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Created but not yet confirmed by the seller
    Pending,
    /// Confirmed by the seller
    Confirmed,
    /// Cancelled; terminal
    Cancelled,
}

/// Read-only copy of a booking taken when an event is raised.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingSnapshot {
    /// Booking identifier
    pub booking_id: Uuid,
    /// Customer who made the booking
    pub customer_id: String,
    /// Seller that owns the booked product
    pub seller_id: String,
    /// Booked product
    pub product_id: String,
    /// Free-form location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Start of the booked period
    pub start_time: DateTime<Utc>,
    /// End of the booked period
    pub end_time: DateTime<Utc>,
    /// Optional reminder time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder: Option<DateTime<Utc>>,
    /// Number of guests
    pub number_of_guests: u32,
    /// Requested room type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    /// Customer notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Current status
    pub status: BookingStatus,
    /// Whether the booking has been paid
    pub paid: bool,
    /// Amount paid in minor currency units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<u64>,
}

impl BookingSnapshot {
    /// A pending one-night booking for the given customer and seller.
    ///
    /// Handy for docs and tests where only the parties matter.
    #[must_use]
    pub fn example(customer_id: &str, seller_id: &str) -> Self {
        let start_time = DateTime::<Utc>::from_timestamp(1_767_225_600, 0).unwrap_or_default();
        Self {
            booking_id: Uuid::new_v4(),
            customer_id: customer_id.to_string(),
            seller_id: seller_id.to_string(),
            product_id: "P1".to_string(),
            location: None,
            start_time,
            end_time: start_time + chrono::Duration::days(1),
            reminder: None,
            number_of_guests: 1,
            room_type: None,
            notes: None,
            status: BookingStatus::Pending,
            paid: false,
            amount_paid: None,
        }
    }
}

/// An event that can be wrapped into an envelope and relayed.
pub trait Event: Send + Sync + 'static {
    /// Stable name of the concrete event, used as the envelope's `eventType`.
    fn event_type(&self) -> &'static str;

    /// Key used to correlate events that belong to the same aggregate.
    fn correlation_id(&self) -> String;
}

/// Everything that can happen to a booking.
///
/// Serialized with an explicit `eventType` tag so consumers can route on the
/// payload alone:
///
/// ```json
/// {"eventType":"BookingCreated","booking":{"bookingId":"...","customerId":"C1"}}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "booking")]
pub enum BookingEvent {
    /// A new booking was created
    #[serde(rename = "BookingCreated")]
    Created(BookingSnapshot),
    /// The seller confirmed a pending booking
    #[serde(rename = "BookingConfirmed")]
    Confirmed(BookingSnapshot),
    /// The booking was cancelled
    #[serde(rename = "BookingCancelled")]
    Cancelled(BookingSnapshot),
    /// Payment was received
    #[serde(rename = "BookingPaid")]
    Paid(BookingSnapshot),
    /// Customer notes changed
    #[serde(rename = "BookingNoteChanged")]
    NoteChanged(BookingSnapshot),
}

impl BookingEvent {
    /// The snapshot carried by this event.
    #[must_use]
    pub const fn booking(&self) -> &BookingSnapshot {
        match self {
            Self::Created(b)
            | Self::Confirmed(b)
            | Self::Cancelled(b)
            | Self::Paid(b)
            | Self::NoteChanged(b) => b,
        }
    }
}

impl Event for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => "BookingCreated",
            Self::Confirmed(_) => "BookingConfirmed",
            Self::Cancelled(_) => "BookingCancelled",
            Self::Paid(_) => "BookingPaid",
            Self::NoteChanged(_) => "BookingNoteChanged",
        }
    }

    fn correlation_id(&self) -> String {
        self.booking().booking_id.to_string()
    }
}

impl fmt::Display for BookingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ booking: {} }}", self.event_type(), self.booking().booking_id)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_serialized_tag() {
        let snapshot = BookingSnapshot::example("C1", "S1");
        let events = [
            BookingEvent::Created(snapshot.clone()),
            BookingEvent::Confirmed(snapshot.clone()),
            BookingEvent::Cancelled(snapshot.clone()),
            BookingEvent::Paid(snapshot.clone()),
            BookingEvent::NoteChanged(snapshot),
        ];

        for event in &events {
            let json = serde_json::to_value(event).expect("event serializes");
            assert_eq!(json["eventType"], event.event_type());
        }
    }

    #[test]
    fn snapshot_uses_camel_case() {
        let event = BookingEvent::Created(BookingSnapshot::example("C1", "S1"));
        let json = serde_json::to_value(&event).expect("event serializes");

        assert_eq!(json["booking"]["customerId"], "C1");
        assert_eq!(json["booking"]["sellerId"], "S1");
        assert!(json["booking"].get("location").is_none());
    }

    #[test]
    fn correlation_id_is_booking_id() {
        let snapshot = BookingSnapshot::example("C1", "S1");
        let id = snapshot.booking_id;
        let event = BookingEvent::Paid(snapshot);
        assert_eq!(event.correlation_id(), id.to_string());
    }

    #[test]
    fn display_names_event_and_booking() {
        let snapshot = BookingSnapshot::example("C1", "S1");
        let id = snapshot.booking_id;
        let shown = BookingEvent::Cancelled(snapshot).to_string();
        assert!(shown.contains("BookingCancelled"));
        assert!(shown.contains(&id.to_string()));
    }
}
