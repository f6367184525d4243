//! Calendar reconciliation
//!
//! Turns Google push notifications into ledger changes. A notification only
//! says "something changed", so the engine lists the events updated within a
//! short trailing window and processes them one by one. Each event is
//! isolated: a failure is logged and counted, and the batch carries on.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::inference::{BookingIntent, CalendarEventPayload, HotelContext, InferenceClient};
use common::phone::{self, MIN_CONTACT_DIGITS};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    availability::{Stay, stay_price},
    dedup::NotificationDedup,
    error::LedgerError,
    google::{CalendarApi, CalendarEvent},
    models::{BookingStatus, ExternalBooking, Lead, RoomType, SyncSummary},
    repositories::Repositories,
};

/// Written into the description of every event this service creates
pub const SYSTEM_MARKER: &str = "AutoBooks booking id:";

/// Extracts booking intent from a calendar event
#[async_trait]
pub trait BookingExtractor: Send + Sync {
    async fn extract(
        &self,
        event: &CalendarEventPayload,
        hotel: &HotelContext,
    ) -> Result<BookingIntent>;
}

#[async_trait]
impl BookingExtractor for InferenceClient {
    async fn extract(
        &self,
        event: &CalendarEventPayload,
        hotel: &HotelContext,
    ) -> Result<BookingIntent> {
        Ok(self.extract_booking(event, hotel).await?)
    }
}

/// What happened to one calendar event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Written by this service, ignored
    SelfOriginated,
    Cancelled,
    /// Cancelled in the calendar without a live booking
    CancelNoop,
    Created,
    Updated,
    Unresolvable(String),
    NoAvailability,
}

/// What happened to one notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Duplicate,
    UnknownResource,
    Synced {
        #[serde(rename = "userId")]
        user_id: Uuid,
        summary: SyncSummary,
    },
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub sync_window: chrono::Duration,
    pub country_code: String,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            sync_window: chrono::Duration::seconds(120),
            country_code: "55".to_string(),
        }
    }
}

/// Keeps the booking ledger in step with each owner's Google Calendar
#[derive(Clone)]
pub struct Reconciler {
    repos: Repositories,
    calendar: Arc<dyn CalendarApi>,
    extractor: Arc<dyn BookingExtractor>,
    dedup: Arc<dyn NotificationDedup>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        repos: Repositories,
        calendar: Arc<dyn CalendarApi>,
        extractor: Arc<dyn BookingExtractor>,
        dedup: Arc<dyn NotificationDedup>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            repos,
            calendar,
            extractor,
            dedup,
            settings,
        }
    }

    /// Handle one push notification for a watched calendar
    pub async fn handle_notification(&self, resource_id: &str) -> Result<NotificationOutcome> {
        if !self.dedup.claim(resource_id).await {
            debug!(resource_id, "Duplicate calendar notification suppressed");
            return Ok(NotificationOutcome::Duplicate);
        }

        let Some(integration) = self.repos.integrations.find_by_resource_id(resource_id).await?
        else {
            warn!(resource_id, "Notification for an unknown calendar resource");
            return Ok(NotificationOutcome::UnknownResource);
        };
        let user_id = integration.user_id;

        let updated_min = Utc::now() - self.settings.sync_window;
        let events = self
            .calendar
            .list_updated_events(&integration.refresh_token, updated_min)
            .await?;
        let rooms = self.repos.rooms.list_for_user(user_id).await?;

        let mut summary = SyncSummary {
            events: events.len(),
            ..Default::default()
        };

        for event in &events {
            match self.process_event(user_id, &rooms, event).await {
                Ok(outcome) => {
                    debug!(event_id = %event.id, updated = ?event.updated, ?outcome, "Processed calendar event");
                    match outcome {
                        EventOutcome::Created => summary.created += 1,
                        EventOutcome::Updated => summary.updated += 1,
                        EventOutcome::Cancelled => summary.cancelled += 1,
                        EventOutcome::SelfOriginated
                        | EventOutcome::CancelNoop
                        | EventOutcome::Unresolvable(_)
                        | EventOutcome::NoAvailability => summary.skipped += 1,
                    }
                }
                Err(e) => {
                    error!(event_id = %event.id, %user_id, "Failed to process calendar event: {:#}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            %user_id,
            events = summary.events,
            created = summary.created,
            updated = summary.updated,
            cancelled = summary.cancelled,
            skipped = summary.skipped,
            failed = summary.failed,
            "Calendar sync finished"
        );

        Ok(NotificationOutcome::Synced { user_id, summary })
    }

    /// Apply one calendar event to the ledger
    pub async fn process_event(
        &self,
        user_id: Uuid,
        rooms: &[RoomType],
        event: &CalendarEvent,
    ) -> Result<EventOutcome> {
        let own_event = event
            .description
            .as_deref()
            .is_some_and(|d| d.contains(SYSTEM_MARKER));
        if own_event {
            return Ok(EventOutcome::SelfOriginated);
        }

        if event.is_cancelled() {
            return match self.repos.ledger.cancel_by_external_event(&event.id).await? {
                Some(booking) => {
                    info!(booking_id = %booking.id, event_id = %event.id, "Cancelled booking from calendar");
                    Ok(EventOutcome::Cancelled)
                }
                None => Ok(EventOutcome::CancelNoop),
            };
        }

        let (Some(start), Some(end)) = (event.start.as_ref(), event.end.as_ref()) else {
            return Ok(unresolvable(event, "missing start or end"));
        };
        let (Some(start_date), Some(end_date)) = (start.calendar_date(), end.calendar_date())
        else {
            return Ok(unresolvable(event, "unreadable start or end"));
        };
        let Some(stay) = Stay::from_event(start_date, end_date, start.is_all_day()) else {
            return Ok(unresolvable(event, "spans no night"));
        };
        if rooms.is_empty() {
            return Ok(unresolvable(event, "hotel has no room types"));
        }

        let payload = CalendarEventPayload {
            id: event.id.clone(),
            summary: event.summary.clone(),
            description: event.description.clone(),
            start: start.raw().unwrap_or_default(),
            end: end.raw().unwrap_or_default(),
            created: event.created.clone(),
        };
        let hotel = HotelContext {
            id: user_id.to_string(),
            room_names: rooms.iter().map(|r| r.name.clone()).collect(),
        };
        let intent = self.extractor.extract(&payload, &hotel).await?;

        let Some(room) = match_room(rooms, intent.room_name.as_deref()) else {
            let reason = format!("unknown room {:?}", intent.room_name);
            return Ok(unresolvable(event, &reason));
        };

        let lead = self.resolve_lead(user_id, &intent).await?;
        let booking = ExternalBooking {
            user_id,
            lead_id: lead.id,
            room_type_id: room.id,
            check_in_date: stay.check_in,
            check_out_date: stay.check_out,
            total_price_cents: stay_price(stay.nights, room.daily_rate_cents),
            status: BookingStatus::Confirmed,
            external_calendar_event_id: event.id.clone(),
        };

        match self.repos.ledger.upsert_external(&booking).await {
            Ok((stored, true)) => {
                info!(booking_id = %stored.id, event_id = %event.id, "Created booking from calendar");
                Ok(EventOutcome::Created)
            }
            Ok((stored, false)) => {
                info!(booking_id = %stored.id, event_id = %event.id, "Updated booking from calendar");
                Ok(EventOutcome::Updated)
            }
            Err(LedgerError::NoAvailability { room_type_id }) => {
                warn!(
                    event_id = %event.id,
                    %room_type_id,
                    check_in = %stay.check_in,
                    check_out = %stay.check_out,
                    "Calendar event dropped, room type is full"
                );
                Ok(EventOutcome::NoAvailability)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_lead(&self, user_id: Uuid, intent: &BookingIntent) -> Result<Lead> {
        let name = non_blank(intent.lead_name.as_deref());
        let email = non_blank(intent.lead_email.as_deref());
        let number = intent
            .lead_whatsapp
            .as_deref()
            .map(|raw| phone::normalize(raw, &self.settings.country_code))
            .filter(|n| n.len() >= MIN_CONTACT_DIGITS);

        let lead = match number {
            Some(number) => {
                self.repos
                    .leads
                    .find_or_create_by_whatsapp(user_id, &number)
                    .await?
            }
            None => return self.create_anonymous_lead(user_id, name, email).await,
        };

        if name.is_none() && email.is_none() {
            return Ok(lead);
        }
        self.repos.leads.update_contact(lead.id, name, email).await
    }

    async fn create_anonymous_lead(
        &self,
        user_id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Lead> {
        let lead = self.repos.leads.create_anonymous(user_id, name).await?;
        match email {
            Some(email) => self.repos.leads.update_contact(lead.id, None, Some(email)).await,
            None => Ok(lead),
        }
    }
}

fn unresolvable(event: &CalendarEvent, reason: &str) -> EventOutcome {
    warn!(event_id = %event.id, reason, "Calendar event is unresolvable");
    EventOutcome::Unresolvable(reason.to_string())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Catalog entry whose name matches, ignoring case
fn match_room<'a>(rooms: &'a [RoomType], name: Option<&str>) -> Option<&'a RoomType> {
    let name = non_blank(name)?.to_lowercase();
    rooms.iter().find(|r| r.name.trim().to_lowercase() == name)
}
