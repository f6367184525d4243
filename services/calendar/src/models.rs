//! Ledger, inventory and integration models

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Room privacy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Private,
    Shared,
}

impl FromStr for Privacy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Privacy::Private),
            "shared" => Ok(Privacy::Shared),
            other => Err(format!("unknown privacy mode '{other}'")),
        }
    }
}

/// Bookable room category
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomType {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub privacy: Privacy,
    pub capacity: i32,
    pub total_quantity: i32,
    pub daily_rate_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    ConfirmedExternally,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::ConfirmedExternally => "confirmed_externally",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the booking holds inventory
    pub fn is_live(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "confirmed_externally" => Ok(BookingStatus::ConfirmedExternally),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub lead_id: Uuid,
    pub room_type_id: Uuid,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub total_price_cents: i64,
    pub status: BookingStatus,
    pub payment_reference: Option<String>,
    pub external_calendar_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Booking created by the payment flow
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBooking {
    pub user_id: Uuid,
    pub lead_id: Uuid,
    pub room_type_id: Uuid,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    #[serde(default)]
    pub total_price_cents: Option<i64>,
    #[serde(default)]
    pub payment_reference: Option<String>,
}

/// Booking derived from a calendar event, keyed by the event id
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalBooking {
    pub user_id: Uuid,
    pub lead_id: Uuid,
    pub room_type_id: Uuid,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub total_price_cents: i64,
    pub status: BookingStatus,
    pub external_calendar_event_id: String,
}

/// Prospective guest tracked per hotel owner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    pub user_id: Uuid,
    pub contact_whatsapp: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub status: String,
}

/// Stored Google Calendar integration and its push channel
#[derive(Debug, Clone, PartialEq)]
pub struct GoogleIntegration {
    pub user_id: Uuid,
    pub refresh_token: String,
    pub google_email: Option<String>,
    pub watch_channel_id: Option<String>,
    pub watch_resource_id: Option<String>,
    pub watch_expires_at: Option<DateTime<Utc>>,
}

/// A registered push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchChannel {
    pub channel_id: String,
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Counts for one webhook-triggered sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub events: usize,
    pub created: usize,
    pub updated: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Counts for one watch renewal run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalSummary {
    pub due: usize,
    pub renewed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBookingRequest {
    #[serde(default)]
    pub payment_reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityQuery {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    #[serde(default)]
    pub exclude_booking_id: Option<Uuid>,
}
