//! Repositories for database operations
//!
//! Each concern is a trait so the reconciliation engine and the booking flow
//! can run against PostgreSQL in production and an in-memory store in tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::LedgerError,
    models::{Booking, ExternalBooking, GoogleIntegration, Lead, NewBooking, RoomType, WatchChannel},
};

pub mod bookings;
pub mod integrations;
pub mod leads;
#[cfg(test)]
pub mod memory;
pub mod rooms;

pub use bookings::PgBookingLedger;
pub use integrations::PgIntegrationRepository;
pub use leads::PgLeadRepository;
pub use rooms::PgRoomRepository;

/// Prefix of the synthetic contact given to leads without a phone number
pub const ANONYMOUS_CONTACT_PREFIX: &str = "calendar-";

/// Room catalog of a hotel owner
#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<RoomType>>;

    async fn find(&self, id: Uuid) -> Result<Option<RoomType>>;
}

/// Guest contacts tracked per hotel owner
#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<Lead>>;

    /// Lead for a normalized WhatsApp number, created on first sight
    async fn find_or_create_by_whatsapp(&self, user_id: Uuid, whatsapp: &str) -> Result<Lead>;

    /// Overwrite the fields that are present, keep the others
    async fn update_contact(
        &self,
        lead_id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Lead>;

    /// Lead with a unique placeholder contact
    async fn create_anonymous(&self, user_id: Uuid, name: Option<&str>) -> Result<Lead>;
}

/// The booking ledger
///
/// Implementations serialize the availability check and the write for a room
/// type, so two concurrent requests for the last unit cannot both succeed.
#[async_trait]
pub trait BookingLedger: Send + Sync {
    /// Free units of a room type over `[check_in, check_out)`
    ///
    /// Unknown room types have no availability.
    async fn check_availability(
        &self,
        room_type_id: Uuid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        exclude_booking_id: Option<Uuid>,
    ) -> Result<i64, LedgerError>;

    /// Insert a pending booking, pricing it from the room rate when no total is given
    async fn create_pending(&self, booking: &NewBooking) -> Result<Booking, LedgerError>;

    async fn confirm(
        &self,
        id: Uuid,
        payment_reference: Option<&str>,
    ) -> Result<Booking, LedgerError>;

    async fn attach_event(&self, id: Uuid, event_id: &str) -> Result<(), LedgerError>;

    async fn cancel(&self, id: Uuid) -> Result<Booking, LedgerError>;

    /// Cancel the live booking of a calendar event
    ///
    /// Returns `None` when the event has no live booking.
    async fn cancel_by_external_event(&self, event_id: &str)
    -> Result<Option<Booking>, LedgerError>;

    async fn find(&self, id: Uuid) -> Result<Option<Booking>, LedgerError>;

    /// The live booking of a calendar event
    async fn find_by_external_event(&self, event_id: &str) -> Result<Option<Booking>, LedgerError>;

    /// The pending booking awaiting a payment
    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Booking>, LedgerError>;

    /// Create or overwrite the live booking of a calendar event
    ///
    /// Returns the booking and whether it was created.
    async fn upsert_external(
        &self,
        booking: &ExternalBooking,
    ) -> Result<(Booking, bool), LedgerError>;
}

/// Stored Google Calendar integrations
#[async_trait]
pub trait IntegrationRepository: Send + Sync {
    async fn find(&self, user_id: Uuid) -> Result<Option<GoogleIntegration>>;

    async fn find_by_resource_id(&self, resource_id: &str) -> Result<Option<GoogleIntegration>>;

    /// Integrations without a watch or whose watch expires before `before`
    async fn find_expiring(&self, before: DateTime<Utc>) -> Result<Vec<GoogleIntegration>>;

    /// Replace the stored watch channel
    async fn save_watch(&self, user_id: Uuid, channel: &WatchChannel) -> Result<()>;

    async fn delete(&self, user_id: Uuid) -> Result<bool>;
}

/// Every repository the service works with
#[derive(Clone)]
pub struct Repositories {
    pub rooms: Arc<dyn RoomRepository>,
    pub leads: Arc<dyn LeadRepository>,
    pub ledger: Arc<dyn BookingLedger>,
    pub integrations: Arc<dyn IntegrationRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            rooms: Arc::new(PgRoomRepository::new(pool.clone())),
            leads: Arc::new(PgLeadRepository::new(pool.clone())),
            ledger: Arc::new(PgBookingLedger::new(pool.clone())),
            integrations: Arc::new(PgIntegrationRepository::new(pool)),
        }
    }

    #[cfg(test)]
    pub fn in_memory(store: Arc<memory::InMemoryStore>) -> Self {
        Self {
            rooms: store.clone(),
            leads: store.clone(),
            ledger: store.clone(),
            integrations: store,
        }
    }
}

/// Reject empty or inverted stays
pub fn validate_range(check_in: NaiveDate, check_out: NaiveDate) -> Result<(), LedgerError> {
    if check_out <= check_in {
        return Err(LedgerError::Invalid(format!(
            "check-out {check_out} must be after check-in {check_in}"
        )));
    }
    Ok(())
}

/// Placeholder contact for a lead created without a phone number
pub fn anonymous_contact() -> String {
    format!("{}{}", ANONYMOUS_CONTACT_PREFIX, Uuid::new_v4())
}
