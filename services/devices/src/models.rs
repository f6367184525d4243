//! Device models and HTTP payloads

use chrono::{DateTime, Utc};
use common::phone::{self, MIN_CONTACT_DIGITS};
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Marker returned when stored credentials resumed the session
pub const CONNECTED_MARKER: &str = "CONNECTED";

/// Device configuration descriptor
///
/// Persisted next to the session credentials so that sessions can be
/// rehydrated after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "user_id")]
    pub owner_user_id: String,
    #[serde(rename = "whatsappNumber")]
    pub phone_number: String,
    #[serde(rename = "authPath", default, skip_serializing_if = "Option::is_none")]
    pub auth_path: Option<String>,
}

impl DeviceConfig {
    /// Normalize the phone number and derive the device id from it
    pub fn normalized(mut self, country_code: &str) -> Result<Self, DeviceError> {
        let number = phone::normalize(&self.phone_number, country_code);
        if number.len() < MIN_CONTACT_DIGITS {
            return Err(DeviceError::InvalidConfig(format!(
                "phone number '{}' is too short",
                self.phone_number
            )));
        }
        if self.owner_user_id.trim().is_empty() {
            return Err(DeviceError::InvalidConfig("user_id is required".to_string()));
        }

        self.id = phone::device_id_for(&number);
        self.phone_number = number;
        Ok(self)
    }
}

/// Scannable pairing code
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    /// Raw pairing string emitted by the protocol
    pub code: String,
    /// SVG rendering of the code as a data URL
    pub image_data_url: String,
}

/// Result of a connect request
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// Fresh pairing: the code must be scanned
    Pairing(PairingPayload),
    /// Stored credentials resumed the session
    Connected,
}

/// Serializable status of a device
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub whatsapp_number: String,
    pub connected: bool,
    pub error: Option<String>,
    pub auth_path: Option<String>,
    pub awaiting_pairing: bool,
}

/// Aggregate statistics for one conversation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    pub device_id: String,
    pub whatsapp_number: String,
    pub message_count: usize,
    pub last_message: Option<DateTime<Utc>>,
}

/// Aggregate statistics over all conversations
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_conversations: usize,
    pub conversations: Vec<ConversationStats>,
}

/// Registry snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub devices: Vec<DeviceStatus>,
    pub chat_history: HistoryStats,
}

/// Outcome counts of a `reconnect_all` run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectSummary {
    pub total: usize,
    pub resumed: usize,
    pub needs_pairing: usize,
    pub failed: usize,
}

/// Request body for `POST /api/devices/connect`
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    #[serde(flatten)]
    pub device: DeviceConfig,
    #[serde(rename = "forceNew", default = "default_force_new")]
    pub force_new: bool,
}

fn default_force_new() -> bool {
    true
}

/// Request body for `POST /api/devices/disconnect`
#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectRequest {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

/// Request body for `POST /api/devices/:device_id/messages`
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub to: String,
    pub text: String,
}
