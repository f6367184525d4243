//! Client for the external inference service
//!
//! The service answers guest chat messages and extracts structured booking
//! intent from calendar events. Every request carries the shared secret in
//! the `x-api-key` header.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, error};

pub use crate::error::InferenceError;

/// Header carrying the shared secret
pub const API_KEY_HEADER: &str = "x-api-key";

/// Inference client configuration
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Base URL of the service (e.g., "https://inference.internal")
    pub base_url: String,
    /// Shared secret sent as `x-api-key`
    pub api_key: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl InferenceConfig {
    /// Create a new InferenceConfig from environment variables
    ///
    /// # Environment Variables
    /// - `IA_BASE_URL`: Base URL of the inference service (required)
    /// - `API_SECRET_KEY`: Shared secret (required)
    /// - `INFERENCE_TIMEOUT_SECS`: Request timeout (default: 30)
    pub fn from_env() -> Result<Self, InferenceError> {
        let base_url = std::env::var("IA_BASE_URL").map_err(|_| {
            InferenceError::Configuration("IA_BASE_URL environment variable not set".to_string())
        })?;
        let api_key = std::env::var("API_SECRET_KEY").map_err(|_| {
            InferenceError::Configuration(
                "API_SECRET_KEY environment variable not set".to_string(),
            )
        })?;
        let timeout_secs = std::env::var("INFERENCE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            base_url,
            api_key,
            timeout_secs,
        })
    }
}

/// Chat turn forwarded to the assistant
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    pub chat_history: String,
    pub lead_whatsapp_number: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    response_gemini: Option<String>,
}

/// Calendar event fields sent for booking extraction
#[derive(Debug, Clone, Serialize)]
pub struct CalendarEventPayload {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub start: String,
    pub end: String,
    pub created: Option<String>,
}

/// Hotel context for booking extraction
#[derive(Debug, Clone, Serialize)]
pub struct HotelContext {
    pub id: String,
    pub room_names: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExtractionRequest<'a> {
    event: &'a CalendarEventPayload,
    user: &'a HotelContext,
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    response: BookingIntent,
}

/// Booking intent extracted from a calendar event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingIntent {
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub lead_name: Option<String>,
    #[serde(default)]
    pub lead_whatsapp: Option<String>,
    #[serde(default)]
    pub lead_email: Option<String>,
}

/// HTTP client for the inference service
#[derive(Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    config: InferenceConfig,
}

impl InferenceClient {
    /// Create a new inference client
    pub fn new(config: InferenceConfig) -> Result<Self, InferenceError> {
        if config.base_url.trim().is_empty() {
            return Err(InferenceError::Configuration(
                "Inference base URL is empty".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { http, config })
    }

    /// Ask the assistant to answer a guest message
    pub async fn process_whatsapp_message(
        &self,
        request: &ChatRequest,
    ) -> Result<String, InferenceError> {
        let response: ChatResponse = self.post_json("process_whatsapp_message", request).await?;

        response
            .response_gemini
            .filter(|reply| !reply.trim().is_empty())
            .ok_or_else(|| InferenceError::MalformedResponse("empty reply".to_string()))
    }

    /// Extract booking intent from a calendar event
    pub async fn extract_booking(
        &self,
        event: &CalendarEventPayload,
        hotel: &HotelContext,
    ) -> Result<BookingIntent, InferenceError> {
        let request = ExtractionRequest { event, user: hotel };
        let response: ExtractionResponse = self.post_json("handleWebhook", &request).await?;
        Ok(response.response)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, InferenceError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        debug!(url = %url, "Calling inference service");

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(url = %url, status = %status, "Inference service returned an error");
            return Err(InferenceError::Status { status, body });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| InferenceError::MalformedResponse(e.to_string()))
    }
}
