//! Booking aggregate.
//!
//! The aggregate records the events raised by each state change in an internal
//! buffer. The write path drains them with [`Booking::take_events`] after the
//! change is committed and hands them to the dispatcher. Draining is the only
//! way events leave the aggregate, so an event can never be dispatched twice
//! from the same instance.

use crate::event::{BookingEvent, BookingSnapshot, BookingStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

const MAX_TEXT_LEN: usize = 200;
const MAX_NOTES_LEN: usize = 1000;

/// Rejected booking input or transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// A required identifier was empty
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),

    /// The booked period is empty or inverted
    #[error("start_time must be before end_time")]
    InvalidPeriod,

    /// Guest count must be positive
    #[error("number_of_guests must be greater than zero")]
    NoGuests,

    /// A text field exceeded its maximum length
    #[error("{field} exceeds {max} characters")]
    TooLong {
        /// Field name
        field: &'static str,
        /// Maximum allowed length
        max: usize,
    },

    /// Cancelled bookings cannot be paid
    #[error("booking {0} is cancelled")]
    Cancelled(Uuid),
}

/// Input for [`Booking::create`].
#[derive(Clone, Debug)]
pub struct NewBooking {
    /// Customer making the booking
    pub customer_id: String,
    /// Seller owning the product
    pub seller_id: String,
    /// Booked product
    pub product_id: String,
    /// Free-form location
    pub location: Option<String>,
    /// Start of the booked period
    pub start_time: DateTime<Utc>,
    /// End of the booked period
    pub end_time: DateTime<Utc>,
    /// Number of guests
    pub number_of_guests: u32,
    /// Requested room type
    pub room_type: Option<String>,
    /// Customer notes
    pub notes: Option<String>,
}

/// A booking and the events raised since they were last taken.
#[derive(Clone, Debug)]
pub struct Booking {
    state: BookingSnapshot,
    pending: Vec<BookingEvent>,
}

impl Booking {
    /// Create a booking, raising `BookingCreated`.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError`] when identifiers are empty, the period is not
    /// strictly increasing, there are no guests, or a text field is too long.
    pub fn create(input: NewBooking) -> Result<Self, BookingError> {
        if input.customer_id.trim().is_empty() {
            return Err(BookingError::EmptyField("customer_id"));
        }
        if input.seller_id.trim().is_empty() {
            return Err(BookingError::EmptyField("seller_id"));
        }
        if input.product_id.trim().is_empty() {
            return Err(BookingError::EmptyField("product_id"));
        }
        if input.start_time >= input.end_time {
            return Err(BookingError::InvalidPeriod);
        }
        if input.number_of_guests == 0 {
            return Err(BookingError::NoGuests);
        }
        check_len("location", input.location.as_deref(), MAX_TEXT_LEN)?;
        check_len("room_type", input.room_type.as_deref(), MAX_TEXT_LEN)?;
        check_len("notes", input.notes.as_deref(), MAX_NOTES_LEN)?;

        let state = BookingSnapshot {
            booking_id: Uuid::new_v4(),
            customer_id: input.customer_id,
            seller_id: input.seller_id,
            product_id: input.product_id,
            location: input.location,
            start_time: input.start_time,
            end_time: input.end_time,
            reminder: None,
            number_of_guests: input.number_of_guests,
            room_type: input.room_type,
            notes: input.notes,
            status: BookingStatus::Pending,
            paid: false,
            amount_paid: None,
        };

        let mut booking = Self {
            state,
            pending: Vec::new(),
        };
        booking.raise(BookingEvent::Created);
        Ok(booking)
    }

    /// Current state of the booking.
    #[must_use]
    pub const fn snapshot(&self) -> &BookingSnapshot {
        &self.state
    }

    /// Booking identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.state.booking_id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> BookingStatus {
        self.state.status
    }

    /// Confirm a pending booking. Other states are left untouched.
    pub fn confirm(&mut self) {
        if self.state.status == BookingStatus::Pending {
            self.state.status = BookingStatus::Confirmed;
            self.raise(BookingEvent::Confirmed);
        }
    }

    /// Cancel the booking unless it is already cancelled.
    pub fn cancel(&mut self) {
        if self.state.status != BookingStatus::Cancelled {
            self.state.status = BookingStatus::Cancelled;
            self.raise(BookingEvent::Cancelled);
        }
    }

    /// Record payment. Paying twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Cancelled`] if the booking was cancelled.
    pub fn mark_paid(&mut self, amount: u64) -> Result<(), BookingError> {
        if self.state.status == BookingStatus::Cancelled {
            return Err(BookingError::Cancelled(self.state.booking_id));
        }
        if !self.state.paid {
            self.state.paid = true;
            self.state.amount_paid = Some(amount);
            self.raise(BookingEvent::Paid);
        }
        Ok(())
    }

    /// Replace the customer notes.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::TooLong`] if the notes exceed 1000 characters.
    pub fn change_notes(&mut self, notes: Option<String>) -> Result<(), BookingError> {
        check_len("notes", notes.as_deref(), MAX_NOTES_LEN)?;
        if self.state.notes != notes {
            self.state.notes = notes;
            self.raise(BookingEvent::NoteChanged);
        }
        Ok(())
    }

    /// Set or clear the reminder. Raises nothing.
    pub fn set_reminder(&mut self, reminder: Option<DateTime<Utc>>) {
        self.state.reminder = reminder;
    }

    /// Whole days between start and end.
    #[must_use]
    pub fn duration_in_days(&self) -> i64 {
        (self.state.end_time - self.state.start_time).num_days()
    }

    /// Drain the events raised since the last call.
    pub fn take_events(&mut self) -> Vec<BookingEvent> {
        std::mem::take(&mut self.pending)
    }

    fn raise(&mut self, variant: fn(BookingSnapshot) -> BookingEvent) {
        self.pending.push(variant(self.state.clone()));
    }
}

fn check_len(field: &'static str, value: Option<&str>, max: usize) -> Result<(), BookingError> {
    match value {
        Some(v) if v.chars().count() > max => Err(BookingError::TooLong { field, max }),
        _ => Ok(()),
    }
}
