//! Booking flow on top of the ledger
//!
//! Confirmed bookings are published to the owner's calendar with the system
//! marker in the description, so the webhook does not ingest them back.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::LedgerError,
    google::{Attendee, CalendarApi, EventTime, NewCalendarEvent},
    models::{Booking, Lead, NewBooking, RoomType},
    reconcile::SYSTEM_MARKER,
    repositories::{ANONYMOUS_CONTACT_PREFIX, Repositories},
};

const CHECK_IN_TIME: &str = "14:00:00";
const CHECK_OUT_TIME: &str = "12:00:00";

#[derive(Clone)]
pub struct BookingService {
    repos: Repositories,
    calendar: Arc<dyn CalendarApi>,
    time_zone: String,
}

impl BookingService {
    pub fn new(repos: Repositories, calendar: Arc<dyn CalendarApi>, time_zone: String) -> Self {
        Self {
            repos,
            calendar,
            time_zone,
        }
    }

    pub async fn create_pending(&self, booking: &NewBooking) -> Result<Booking, LedgerError> {
        self.repos.ledger.create_pending(booking).await
    }

    /// Confirm a booking and publish it to the owner's calendar
    ///
    /// Calendar failures are logged; the booking stays confirmed.
    pub async fn confirm(
        &self,
        id: Uuid,
        payment_reference: Option<&str>,
    ) -> Result<Booking, LedgerError> {
        let mut booking = self.repos.ledger.confirm(id, payment_reference).await?;
        if booking.external_calendar_event_id.is_some() {
            return Ok(booking);
        }

        match self.publish(&booking).await {
            Ok(Some(event_id)) => booking.external_calendar_event_id = Some(event_id),
            Ok(None) => debug!(booking_id = %booking.id, "Owner has no calendar integration"),
            Err(e) => warn!(booking_id = %booking.id, "Failed to publish booking to calendar: {:#}", e),
        }
        Ok(booking)
    }

    /// Confirm the pending booking paid with `reference`
    pub async fn confirm_payment(&self, reference: &str) -> Result<Option<Booking>, LedgerError> {
        match self.repos.ledger.find_by_payment_reference(reference).await? {
            Some(booking) => Ok(Some(self.confirm(booking.id, None).await?)),
            None => Ok(None),
        }
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Booking, LedgerError> {
        let booking = self.repos.ledger.cancel(id).await?;
        info!(booking_id = %booking.id, "Cancelled booking");
        Ok(booking)
    }

    async fn publish(&self, booking: &Booking) -> Result<Option<String>> {
        let Some(integration) = self.repos.integrations.find(booking.user_id).await? else {
            return Ok(None);
        };
        let lead = self.repos.leads.find(booking.lead_id).await?;
        let room = self.repos.rooms.find(booking.room_type_id).await?;

        let event = booking_event(booking, lead.as_ref(), room.as_ref(), &self.time_zone);
        let event_id = self
            .calendar
            .insert_event(&integration.refresh_token, &event)
            .await?;
        self.repos.ledger.attach_event(booking.id, &event_id).await?;

        info!(booking_id = %booking.id, event_id = %event_id, "Published booking to calendar");
        Ok(Some(event_id))
    }
}

fn booking_event(
    booking: &Booking,
    lead: Option<&Lead>,
    room: Option<&RoomType>,
    time_zone: &str,
) -> NewCalendarEvent {
    let guest = lead.and_then(|l| l.name.clone());
    let whatsapp = lead
        .map(|l| l.contact_whatsapp.clone())
        .filter(|c| !c.starts_with(ANONYMOUS_CONTACT_PREFIX));
    let email = lead.and_then(|l| l.email.clone());
    let not_provided = || "Not provided".to_string();

    let description = format!(
        "New booking confirmed via AutoBooks.\n\
         Guest: {}\n\
         WhatsApp: {}\n\
         Email: {}\n\
         Room: {}\n\
         Total: R$ {}.{:02}\n\
         {} {}",
        guest.clone().unwrap_or_else(not_provided),
        whatsapp.unwrap_or_else(not_provided),
        email.clone().unwrap_or_else(not_provided),
        room.map(|r| r.name.clone()).unwrap_or_else(not_provided),
        booking.total_price_cents / 100,
        booking.total_price_cents % 100,
        SYSTEM_MARKER,
        booking.id,
    );

    let at = |date: chrono::NaiveDate, time: &str| {
        EventTime::timed(format!("{date}T{time}"), Some(time_zone.to_string()))
    };

    NewCalendarEvent {
        summary: format!("Booking: {}", guest.unwrap_or_else(|| "Guest".to_string())),
        description,
        start: at(booking.check_in_date, CHECK_IN_TIME),
        end: at(booking.check_out_date, CHECK_OUT_TIME),
        attendees: email.into_iter().map(|email| Attendee { email }).collect(),
    }
}
