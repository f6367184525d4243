//! Messaging protocol seam
//!
//! The WhatsApp protocol itself lives outside this service. A connector opens
//! one link per device; the link yields a stream of [`ProtocolEvent`]s and a
//! handle used to send text, log out and shut the link down.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::DeviceConfig;

/// Opaque credential blob persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

/// Why a link closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    RestartRequired,
    TimedOut,
    BadSession,
    #[serde(other)]
    Unknown,
}

impl DisconnectReason {
    /// Logged-out closes are terminal; every other close is recoverable
    pub fn is_logout(self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }
}

/// Text-bearing parts of an inbound message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text: Option<String>,
    #[serde(default)]
    pub image_caption: Option<String>,
    #[serde(default)]
    pub video_caption: Option<String>,
    #[serde(default)]
    pub document_caption: Option<String>,
}

impl MessageContent {
    /// First non-blank text in priority order
    pub fn text(&self) -> Option<&str> {
        [
            &self.conversation,
            &self.extended_text,
            &self.image_caption,
            &self.video_caption,
            &self.document_caption,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .map(str::trim)
        .find(|text| !text.is_empty())
    }
}

/// Inbound message as delivered by the protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub id: String,
    /// Chat the message arrived on; replies go here
    pub remote_jid: String,
    /// Phone-number JID of the sender when the chat id is an alias
    #[serde(default)]
    pub sender_pn: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl InboundMessage {
    /// Identifier the sender number is derived from
    pub fn sender_address(&self) -> &str {
        self.sender_pn.as_deref().unwrap_or(&self.remote_jid)
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(MessageContent::text)
    }
}

/// Events emitted by a protocol link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Connecting,
    Qr { code: String },
    Open { jid: String },
    Close { reason: DisconnectReason },
    CredsUpdate { credentials: Credentials },
    Message { message: InboundMessage },
}

/// Errors raised by a protocol link
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to start protocol link: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Protocol link is closed")]
    ChannelClosed,

    #[error("Protocol rejected the request: {0}")]
    Rejected(String),
}

/// Handle to a live protocol link
#[async_trait]
pub trait ProtocolHandle: Send + Sync {
    /// Send a text message to a chat
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ProtocolError>;

    /// Invalidate the session on the phone side
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Close the link without touching the session
    async fn shutdown(&self);
}

/// A freshly opened link
pub struct ProtocolLink {
    pub handle: Arc<dyn ProtocolHandle>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Opens protocol links for devices
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn open(
        &self,
        device: &DeviceConfig,
        credentials: Option<Credentials>,
    ) -> Result<ProtocolLink, ProtocolError>;
}
