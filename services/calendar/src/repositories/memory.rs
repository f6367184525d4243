//! In-memory store used by tests
//!
//! One mutex guards every table, so each ledger operation checks and writes
//! atomically like the PostgreSQL implementation does under its row lock.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BookingLedger, IntegrationRepository, LeadRepository, RoomRepository, anonymous_contact,
    validate_range,
};
use crate::{
    availability::{stay_price, vacancy},
    error::LedgerError,
    models::{
        Booking, BookingStatus, ExternalBooking, GoogleIntegration, Lead, NewBooking, Privacy,
        RoomType, WatchChannel,
    },
};

/// Half-open overlap of two stays, matching the SQL range predicate
fn overlaps(a_in: NaiveDate, a_out: NaiveDate, b_in: NaiveDate, b_out: NaiveDate) -> bool {
    a_in < b_out && a_out > b_in
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<Uuid, RoomType>,
    leads: Vec<Lead>,
    bookings: Vec<Booking>,
    integrations: HashMap<Uuid, GoogleIntegration>,
}

impl Tables {
    fn overlapping(
        &self,
        room_type_id: Uuid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        exclude: Option<Uuid>,
    ) -> i64 {
        self.bookings
            .iter()
            .filter(|b| b.room_type_id == room_type_id && b.status.is_live())
            .filter(|b| Some(b.id) != exclude)
            .filter(|b| overlaps(b.check_in_date, b.check_out_date, check_in, check_out))
            .count() as i64
    }

    fn owned_room(&self, room_type_id: Uuid, user_id: Uuid) -> Result<RoomType, LedgerError> {
        let room = self
            .rooms
            .get(&room_type_id)
            .cloned()
            .ok_or(LedgerError::RoomTypeNotFound(room_type_id))?;
        if room.user_id != user_id {
            return Err(LedgerError::Invalid(format!(
                "room type {room_type_id} does not belong to user {user_id}"
            )));
        }
        Ok(room)
    }

    fn booking_mut(&mut self, id: Uuid) -> Result<&mut Booking, LedgerError> {
        self.bookings
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or(LedgerError::NotFound(id))
    }
}

/// Every repository backed by process memory
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_room(
        &self,
        user_id: Uuid,
        name: &str,
        privacy: Privacy,
        capacity: i32,
        total_quantity: i32,
        daily_rate_cents: i64,
    ) -> RoomType {
        let room = RoomType {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            privacy,
            capacity,
            total_quantity,
            daily_rate_cents,
        };
        self.tables
            .lock()
            .await
            .rooms
            .insert(room.id, room.clone());
        room
    }

    pub async fn add_integration(&self, integration: GoogleIntegration) {
        self.tables
            .lock()
            .await
            .integrations
            .insert(integration.user_id, integration);
    }

    pub async fn bookings(&self) -> Vec<Booking> {
        self.tables.lock().await.bookings.clone()
    }

    pub async fn leads(&self) -> Vec<Lead> {
        self.tables.lock().await.leads.clone()
    }
}

#[async_trait]
impl RoomRepository for InMemoryStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<RoomType>> {
        let tables = self.tables.lock().await;
        let mut rooms: Vec<_> = tables
            .rooms
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rooms)
    }

    async fn find(&self, id: Uuid) -> Result<Option<RoomType>> {
        Ok(self.tables.lock().await.rooms.get(&id).cloned())
    }
}

#[async_trait]
impl LeadRepository for InMemoryStore {
    async fn find(&self, id: Uuid) -> Result<Option<Lead>> {
        let tables = self.tables.lock().await;
        Ok(tables.leads.iter().find(|l| l.id == id).cloned())
    }

    async fn find_or_create_by_whatsapp(&self, user_id: Uuid, whatsapp: &str) -> Result<Lead> {
        let mut tables = self.tables.lock().await;
        if let Some(lead) = tables
            .leads
            .iter()
            .find(|l| l.user_id == user_id && l.contact_whatsapp == whatsapp)
        {
            return Ok(lead.clone());
        }

        let lead = Lead {
            id: Uuid::new_v4(),
            user_id,
            contact_whatsapp: whatsapp.to_string(),
            name: None,
            email: None,
            status: "cold".to_string(),
        };
        tables.leads.push(lead.clone());
        Ok(lead)
    }

    async fn update_contact(
        &self,
        lead_id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Lead> {
        let mut tables = self.tables.lock().await;
        let lead = tables
            .leads
            .iter_mut()
            .find(|l| l.id == lead_id)
            .ok_or_else(|| anyhow!("Lead not found: {}", lead_id))?;

        if let Some(name) = name {
            lead.name = Some(name.to_string());
        }
        if let Some(email) = email {
            lead.email = Some(email.to_string());
        }
        Ok(lead.clone())
    }

    async fn create_anonymous(&self, user_id: Uuid, name: Option<&str>) -> Result<Lead> {
        let lead = Lead {
            id: Uuid::new_v4(),
            user_id,
            contact_whatsapp: anonymous_contact(),
            name: name.map(str::to_string),
            email: None,
            status: "cold".to_string(),
        };
        self.tables.lock().await.leads.push(lead.clone());
        Ok(lead)
    }
}

#[async_trait]
impl BookingLedger for InMemoryStore {
    async fn check_availability(
        &self,
        room_type_id: Uuid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        exclude_booking_id: Option<Uuid>,
    ) -> Result<i64, LedgerError> {
        validate_range(check_in, check_out)?;
        let tables = self.tables.lock().await;
        let Some(room) = tables.rooms.get(&room_type_id) else {
            return Ok(0);
        };
        let overlapping = tables.overlapping(room_type_id, check_in, check_out, exclude_booking_id);
        Ok(vacancy(room, overlapping))
    }

    async fn create_pending(&self, booking: &NewBooking) -> Result<Booking, LedgerError> {
        validate_range(booking.check_in_date, booking.check_out_date)?;
        let mut tables = self.tables.lock().await;
        let room = tables.owned_room(booking.room_type_id, booking.user_id)?;

        let overlapping = tables.overlapping(
            room.id,
            booking.check_in_date,
            booking.check_out_date,
            None,
        );
        if vacancy(&room, overlapping) < 1 {
            return Err(LedgerError::NoAvailability {
                room_type_id: room.id,
            });
        }

        let nights = (booking.check_out_date - booking.check_in_date).num_days();
        let created = Booking {
            id: Uuid::new_v4(),
            user_id: booking.user_id,
            lead_id: booking.lead_id,
            room_type_id: room.id,
            check_in_date: booking.check_in_date,
            check_out_date: booking.check_out_date,
            total_price_cents: booking
                .total_price_cents
                .unwrap_or_else(|| stay_price(nights, room.daily_rate_cents)),
            status: BookingStatus::Pending,
            payment_reference: booking.payment_reference.clone(),
            external_calendar_event_id: None,
            created_at: Utc::now(),
        };
        tables.bookings.push(created.clone());
        Ok(created)
    }

    async fn confirm(
        &self,
        id: Uuid,
        payment_reference: Option<&str>,
    ) -> Result<Booking, LedgerError> {
        let mut tables = self.tables.lock().await;
        let booking = tables.booking_mut(id)?;
        if booking.status == BookingStatus::Cancelled {
            return Err(LedgerError::Conflict(format!(
                "booking {id} is cancelled and cannot be confirmed"
            )));
        }

        booking.status = BookingStatus::Confirmed;
        if let Some(reference) = payment_reference {
            booking.payment_reference = Some(reference.to_string());
        }
        Ok(booking.clone())
    }

    async fn attach_event(&self, id: Uuid, event_id: &str) -> Result<(), LedgerError> {
        let mut tables = self.tables.lock().await;
        let taken = tables.bookings.iter().any(|b| {
            b.id != id
                && b.status.is_live()
                && b.external_calendar_event_id.as_deref() == Some(event_id)
        });
        if taken {
            return Err(LedgerError::Conflict(format!(
                "calendar event {event_id} already has a live booking"
            )));
        }

        tables.booking_mut(id)?.external_calendar_event_id = Some(event_id.to_string());
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<Booking, LedgerError> {
        let mut tables = self.tables.lock().await;
        let booking = tables.booking_mut(id)?;
        booking.status = BookingStatus::Cancelled;
        Ok(booking.clone())
    }

    async fn cancel_by_external_event(
        &self,
        event_id: &str,
    ) -> Result<Option<Booking>, LedgerError> {
        let mut tables = self.tables.lock().await;
        let live = tables.bookings.iter_mut().find(|b| {
            b.status.is_live() && b.external_calendar_event_id.as_deref() == Some(event_id)
        });

        Ok(live.map(|booking| {
            booking.status = BookingStatus::Cancelled;
            booking.clone()
        }))
    }

    async fn find(&self, id: Uuid) -> Result<Option<Booking>, LedgerError> {
        let tables = self.tables.lock().await;
        Ok(tables.bookings.iter().find(|b| b.id == id).cloned())
    }

    async fn find_by_external_event(&self, event_id: &str) -> Result<Option<Booking>, LedgerError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .bookings
            .iter()
            .find(|b| {
                b.status.is_live() && b.external_calendar_event_id.as_deref() == Some(event_id)
            })
            .cloned())
    }

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Booking>, LedgerError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .bookings
            .iter()
            .find(|b| {
                b.status == BookingStatus::Pending
                    && b.payment_reference.as_deref() == Some(reference)
            })
            .cloned())
    }

    async fn upsert_external(
        &self,
        booking: &ExternalBooking,
    ) -> Result<(Booking, bool), LedgerError> {
        validate_range(booking.check_in_date, booking.check_out_date)?;
        let event_id = booking.external_calendar_event_id.as_str();
        let mut tables = self.tables.lock().await;
        let room = tables.owned_room(booking.room_type_id, booking.user_id)?;

        let existing = tables
            .bookings
            .iter()
            .find(|b| b.status.is_live() && b.external_calendar_event_id.as_deref() == Some(event_id))
            .map(|b| b.id);

        let overlapping = tables.overlapping(
            room.id,
            booking.check_in_date,
            booking.check_out_date,
            existing,
        );
        if vacancy(&room, overlapping) < 1 {
            return Err(LedgerError::NoAvailability {
                room_type_id: room.id,
            });
        }

        match existing {
            Some(id) => {
                let stored = tables.booking_mut(id)?;
                stored.lead_id = booking.lead_id;
                stored.room_type_id = booking.room_type_id;
                stored.check_in_date = booking.check_in_date;
                stored.check_out_date = booking.check_out_date;
                stored.total_price_cents = booking.total_price_cents;
                stored.status = booking.status;
                Ok((stored.clone(), false))
            }
            None => {
                let created = Booking {
                    id: Uuid::new_v4(),
                    user_id: booking.user_id,
                    lead_id: booking.lead_id,
                    room_type_id: booking.room_type_id,
                    check_in_date: booking.check_in_date,
                    check_out_date: booking.check_out_date,
                    total_price_cents: booking.total_price_cents,
                    status: booking.status,
                    payment_reference: None,
                    external_calendar_event_id: Some(event_id.to_string()),
                    created_at: Utc::now(),
                };
                tables.bookings.push(created.clone());
                Ok((created, true))
            }
        }
    }
}

#[async_trait]
impl IntegrationRepository for InMemoryStore {
    async fn find(&self, user_id: Uuid) -> Result<Option<GoogleIntegration>> {
        Ok(self.tables.lock().await.integrations.get(&user_id).cloned())
    }

    async fn find_by_resource_id(&self, resource_id: &str) -> Result<Option<GoogleIntegration>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .integrations
            .values()
            .find(|i| i.watch_resource_id.as_deref() == Some(resource_id))
            .cloned())
    }

    async fn find_expiring(&self, before: DateTime<Utc>) -> Result<Vec<GoogleIntegration>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<_> = tables
            .integrations
            .values()
            .filter(|i| i.watch_expires_at.map(|at| at < before).unwrap_or(true))
            .cloned()
            .collect();
        due.sort_by_key(|i| i.user_id);
        Ok(due)
    }

    async fn save_watch(&self, user_id: Uuid, channel: &WatchChannel) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let integration = tables
            .integrations
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("No Google integration for user {}", user_id))?;

        integration.watch_channel_id = Some(channel.channel_id.clone());
        integration.watch_resource_id = Some(channel.resource_id.clone());
        integration.watch_expires_at = Some(channel.expires_at);
        Ok(())
    }

    async fn delete(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .integrations
            .remove(&user_id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_overlap_is_half_open() {
        let (a_in, a_out) = (date("2025-06-01"), date("2025-06-03"));
        assert!(overlaps(a_in, a_out, date("2025-06-02"), date("2025-06-05")));
        assert!(!overlaps(a_in, a_out, date("2025-06-03"), date("2025-06-05")));
    }

    #[tokio::test]
    async fn test_ocean_view_inventory_runs_out() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        let room = store
            .add_room(user_id, "Ocean View", Privacy::Private, 2, 2, 25_000)
            .await;
        let lead = store
            .find_or_create_by_whatsapp(user_id, "5511987654321")
            .await
            .unwrap();

        let (check_in, check_out) = (date("2025-06-01"), date("2025-06-03"));
        let request = NewBooking {
            user_id,
            lead_id: lead.id,
            room_type_id: room.id,
            check_in_date: check_in,
            check_out_date: check_out,
            total_price_cents: None,
            payment_reference: Some("cs_test_1".to_string()),
        };

        assert_eq!(
            store
                .check_availability(room.id, check_in, check_out, None)
                .await
                .unwrap(),
            2
        );

        let first = store.create_pending(&request).await.unwrap();
        assert_eq!(first.status, BookingStatus::Pending);
        assert_eq!(first.total_price_cents, 50_000);
        assert_eq!(
            store
                .check_availability(room.id, check_in, check_out, None)
                .await
                .unwrap(),
            1
        );

        store.create_pending(&request).await.unwrap();
        assert_eq!(
            store
                .check_availability(room.id, check_in, check_out, None)
                .await
                .unwrap(),
            0
        );

        let third = store.create_pending(&request).await;
        assert!(matches!(third, Err(LedgerError::NoAvailability { .. })));

        // Excluding one of the two bookings frees a unit
        assert_eq!(
            store
                .check_availability(room.id, check_in, check_out, Some(first.id))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancelled_bookings_release_inventory() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        let room = store
            .add_room(user_id, "Suite", Privacy::Private, 2, 1, 10_000)
            .await;
        let lead = store.create_anonymous(user_id, None).await.unwrap();

        let booking = store
            .create_pending(&NewBooking {
                user_id,
                lead_id: lead.id,
                room_type_id: room.id,
                check_in_date: date("2025-06-01"),
                check_out_date: date("2025-06-05"),
                total_price_cents: Some(1),
                payment_reference: Some("cs_test_2".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(booking.total_price_cents, 1);
        assert_eq!(
            store
                .find_by_payment_reference("cs_test_2")
                .await
                .unwrap()
                .map(|b| b.id),
            Some(booking.id)
        );

        store.cancel(booking.id).await.unwrap();
        assert_eq!(
            store
                .check_availability(room.id, date("2025-06-02"), date("2025-06-03"), None)
                .await
                .unwrap(),
            1
        );
        assert!(matches!(
            store.confirm(booking.id, None).await,
            Err(LedgerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_room_has_no_availability() {
        let store = InMemoryStore::new();
        let available = store
            .check_availability(Uuid::new_v4(), date("2025-06-01"), date("2025-06-02"), None)
            .await
            .unwrap();
        assert_eq!(available, 0);
    }

    #[tokio::test]
    async fn test_lead_lookup_reuses_number_and_keeps_missing_fields() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();

        let lead = store
            .find_or_create_by_whatsapp(user_id, "5511987654321")
            .await
            .unwrap();
        store
            .update_contact(lead.id, Some("Maria"), Some("maria@example.com"))
            .await
            .unwrap();
        let updated = store
            .update_contact(lead.id, None, Some("m@example.com"))
            .await
            .unwrap();
        assert_eq!(updated.name.as_deref(), Some("Maria"));
        assert_eq!(updated.email.as_deref(), Some("m@example.com"));

        let again = store
            .find_or_create_by_whatsapp(user_id, "5511987654321")
            .await
            .unwrap();
        assert_eq!(again.id, lead.id);
        assert_eq!(store.leads().await.len(), 1);
    }
}
