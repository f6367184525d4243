//! Google Calendar API client
//!
//! Every call trades the hotel owner's stored refresh token for a short-lived
//! access token, then talks to the owner's primary calendar.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl, basic::BasicClient,
    reqwest::async_http_client,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{error::CalendarError, models::WatchChannel};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const PAGE_SIZE: &str = "250";

/// Start or end of an event
///
/// All-day events carry `date`, timed events carry `dateTime`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventTime {
    pub fn timed(date_time: String, time_zone: Option<String>) -> Self {
        Self {
            date: None,
            date_time: Some(date_time),
            time_zone,
        }
    }

    pub fn is_all_day(&self) -> bool {
        self.date.is_some()
    }

    /// Calendar day in the event's own offset
    pub fn calendar_date(&self) -> Option<NaiveDate> {
        if let Some(date) = self.date {
            return Some(date);
        }

        let raw = self.date_time.as_deref()?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.date_naive());
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|parsed| parsed.date())
    }

    /// The value as Google sent it
    pub fn raw(&self) -> Option<String> {
        self.date
            .map(|date| date.to_string())
            .or_else(|| self.date_time.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<EventTime>,
    #[serde(default)]
    pub end: Option<EventTime>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

impl CalendarEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attendee {
    pub email: String,
}

/// Event written by the booking confirmation flow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewCalendarEvent {
    pub summary: String,
    pub description: String,
    pub start: EventTime,
    pub end: EventTime,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Attendee>,
}

/// Operations on a hotel owner's primary calendar
#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// Events changed since `updated_min`, deleted ones included
    async fn list_updated_events(
        &self,
        refresh_token: &str,
        updated_min: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError>;

    /// Insert an event and return its id
    async fn insert_event(
        &self,
        refresh_token: &str,
        event: &NewCalendarEvent,
    ) -> Result<String, CalendarError>;

    /// Register a push channel delivering change notifications to `webhook_url`
    async fn watch(
        &self,
        refresh_token: &str,
        channel_id: &str,
        webhook_url: &str,
    ) -> Result<WatchChannel, CalendarError>;

    async fn stop_channel(
        &self,
        refresh_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), CalendarError>;
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub api_base: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPage {
    #[serde(default)]
    items: Vec<CalendarEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertedEvent {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResponse {
    id: String,
    resource_id: String,
    expiration: Option<String>,
}

/// Google Calendar client authenticated with per-owner refresh tokens
#[derive(Clone)]
pub struct GoogleCalendarClient {
    oauth: BasicClient,
    http: reqwest::Client,
    api_base: String,
}

impl GoogleCalendarClient {
    pub fn new(config: GoogleConfig) -> Result<Self, CalendarError> {
        let auth_url = AuthUrl::new(config.auth_url.clone())
            .map_err(|e| CalendarError::Configuration(format!("invalid auth URL: {e}")))?;
        let token_url = TokenUrl::new(config.token_url.clone())
            .map_err(|e| CalendarError::Configuration(format!("invalid token URL: {e}")))?;

        let oauth = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            auth_url,
            Some(token_url),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            oauth,
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Exchange a refresh token for an access token
    async fn access_token(&self, refresh_token: &str) -> Result<String, CalendarError> {
        let token = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| CalendarError::Auth(e.to_string()))?;

        Ok(token.access_token().secret().clone())
    }

    async fn read_json<R: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<R, CalendarError> {
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| CalendarError::Malformed(e.to_string()))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CalendarError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        error!(url = %url, status = %status, "Calendar API returned an error");
        Err(CalendarError::Status { status, body })
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn list_updated_events(
        &self,
        refresh_token: &str,
        updated_min: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let access_token = self.access_token(refresh_token).await?;
        let url = format!("{}/calendars/primary/events", self.api_base);
        let updated_min = updated_min.to_rfc3339();

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(&url)
                .bearer_auth(&access_token)
                .query(&[
                    ("updatedMin", updated_min.as_str()),
                    ("showDeleted", "true"),
                    ("singleEvents", "true"),
                    ("maxResults", PAGE_SIZE),
                ]);
            if let Some(token) = page_token.take() {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await?;
            let page: EventPage = self.read_json(response).await?;
            events.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(count = events.len(), "Listed updated calendar events");
        Ok(events)
    }

    async fn insert_event(
        &self,
        refresh_token: &str,
        event: &NewCalendarEvent,
    ) -> Result<String, CalendarError> {
        let access_token = self.access_token(refresh_token).await?;
        let response = self
            .http
            .post(format!("{}/calendars/primary/events", self.api_base))
            .bearer_auth(&access_token)
            .query(&[("sendUpdates", "all")])
            .json(event)
            .send()
            .await?;

        let inserted: InsertedEvent = self.read_json(response).await?;
        info!(event_id = %inserted.id, "Inserted calendar event");
        Ok(inserted.id)
    }

    async fn watch(
        &self,
        refresh_token: &str,
        channel_id: &str,
        webhook_url: &str,
    ) -> Result<WatchChannel, CalendarError> {
        let access_token = self.access_token(refresh_token).await?;
        let response = self
            .http
            .post(format!("{}/calendars/primary/events/watch", self.api_base))
            .bearer_auth(&access_token)
            .json(&json!({
                "id": channel_id,
                "type": "web_hook",
                "address": webhook_url,
            }))
            .send()
            .await?;

        let channel: ChannelResponse = self.read_json(response).await?;
        let expires_at = channel
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| {
                CalendarError::Malformed(format!(
                    "channel {} has no usable expiration",
                    channel.id
                ))
            })?;

        Ok(WatchChannel {
            channel_id: channel.id,
            resource_id: channel.resource_id,
            expires_at,
        })
    }

    async fn stop_channel(
        &self,
        refresh_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), CalendarError> {
        let access_token = self.access_token(refresh_token).await?;
        let response = self
            .http
            .post(format!("{}/channels/stop", self.api_base))
            .bearer_auth(&access_token)
            .json(&json!({ "id": channel_id, "resourceId": resource_id }))
            .send()
            .await?;

        Self::check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    //! Scriptable calendar for engine tests

    use super::*;
    use std::sync::Mutex;

    impl EventTime {
        pub fn all_day(date: NaiveDate) -> Self {
            Self {
                date: Some(date),
                ..Default::default()
            }
        }
    }

    #[derive(Default)]
    pub struct FakeCalendar {
        pub events: Mutex<Vec<CalendarEvent>>,
        pub inserted: Mutex<Vec<NewCalendarEvent>>,
        pub watches: Mutex<Vec<String>>,
        pub stopped: Mutex<Vec<(String, String)>>,
        pub fail_watch: Mutex<bool>,
        pub fail_insert: Mutex<bool>,
    }

    impl FakeCalendar {
        pub fn with_events(events: Vec<CalendarEvent>) -> Self {
            Self {
                events: Mutex::new(events),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CalendarApi for FakeCalendar {
        async fn list_updated_events(
            &self,
            _refresh_token: &str,
            _updated_min: DateTime<Utc>,
        ) -> Result<Vec<CalendarEvent>, CalendarError> {
            Ok(self.events.lock().unwrap().clone())
        }

        async fn insert_event(
            &self,
            _refresh_token: &str,
            event: &NewCalendarEvent,
        ) -> Result<String, CalendarError> {
            if *self.fail_insert.lock().unwrap() {
                return Err(CalendarError::Auth("invalid_grant".to_string()));
            }
            let mut inserted = self.inserted.lock().unwrap();
            inserted.push(event.clone());
            Ok(format!("inserted-{}", inserted.len()))
        }

        async fn watch(
            &self,
            _refresh_token: &str,
            channel_id: &str,
            _webhook_url: &str,
        ) -> Result<WatchChannel, CalendarError> {
            if *self.fail_watch.lock().unwrap() {
                return Err(CalendarError::Auth("invalid_grant".to_string()));
            }
            let mut watches = self.watches.lock().unwrap();
            watches.push(channel_id.to_string());
            Ok(WatchChannel {
                channel_id: channel_id.to_string(),
                resource_id: format!("resource-{}", watches.len()),
                expires_at: Utc::now() + chrono::Duration::days(7),
            })
        }

        async fn stop_channel(
            &self,
            _refresh_token: &str,
            channel_id: &str,
            resource_id: &str,
        ) -> Result<(), CalendarError> {
            self.stopped
                .lock()
                .unwrap()
                .push((channel_id.to_string(), resource_id.to_string()));
            Ok(())
        }
    }
}
