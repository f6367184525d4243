//! Inbound message routing
//!
//! Text from a guest is appended to the conversation history, forwarded to
//! the inference service with that history, and the answer is sent back on
//! the chat it came from.

use common::inference::{ChatRequest, InferenceClient};
use common::phone::{self, MIN_CONTACT_DIGITS};
use tracing::{debug, error, info, warn};

use crate::error::DeviceError;
use crate::history::{ChatHistoryStore, ConversationKey, Role};
use crate::models::DeviceConfig;
use crate::protocol::InboundMessage;
use crate::registry::DeviceRegistry;

pub const DEFAULT_FALLBACK_REPLY: &str =
    "Sorry, I could not process your message right now. Please try again in a few minutes.";

/// What happened to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent by the device itself
    OwnMessage,
    /// No text to answer
    NoText,
    /// Sender number could not be resolved
    UnknownSender,
    /// The assistant's answer was delivered
    Replied,
    /// Inference failed and the apology was delivered
    Apologized,
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: DeviceRegistry,
    history: ChatHistoryStore,
    inference: InferenceClient,
    fallback_reply: String,
    country_code: String,
}

impl MessageRouter {
    pub fn new(
        registry: DeviceRegistry,
        history: ChatHistoryStore,
        inference: InferenceClient,
        fallback_reply: impl Into<String>,
        country_code: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            history,
            inference,
            fallback_reply: fallback_reply.into(),
            country_code: country_code.into(),
        }
    }

    pub fn history(&self) -> &ChatHistoryStore {
        &self.history
    }

    /// Route a message on its own task so the event loop never waits on inference
    pub fn dispatch(&self, device: DeviceConfig, message: InboundMessage) {
        let router = self.clone();
        tokio::spawn(async move {
            match router.handle(&device, &message).await {
                Ok(outcome) => debug!(device_id = %device.id, message_id = %message.id, ?outcome, "Message routed"),
                Err(e) => error!(device_id = %device.id, message_id = %message.id, error = %e, "Failed to deliver reply"),
            }
        });
    }

    pub async fn handle(
        &self,
        device: &DeviceConfig,
        message: &InboundMessage,
    ) -> Result<RouteOutcome, DeviceError> {
        if message.from_me {
            return Ok(RouteOutcome::OwnMessage);
        }
        let Some(text) = message.text() else {
            return Ok(RouteOutcome::NoText);
        };

        let sender = phone::normalize(
            phone::number_from_jid(message.sender_address()),
            &self.country_code,
        );
        if sender.len() < MIN_CONTACT_DIGITS {
            warn!(device_id = %device.id, sender = %message.sender_address(), "Discarding message from unidentifiable sender");
            return Ok(RouteOutcome::UnknownSender);
        }

        let key = ConversationKey::new(&device.id, &sender);
        self.history.append(&key, Role::User, text).await;

        let request = ChatRequest {
            user_id: device.owner_user_id.clone(),
            message: text.to_string(),
            chat_history: self.history.formatted(&key).await,
            lead_whatsapp_number: sender.clone(),
        };

        match self.inference.process_whatsapp_message(&request).await {
            Ok(reply) => {
                self.registry
                    .send_text(&device.id, &message.remote_jid, &reply)
                    .await?;
                self.history.append(&key, Role::Assistant, &reply).await;
                info!(device_id = %device.id, contact = %sender, "Replied to guest");
                Ok(RouteOutcome::Replied)
            }
            Err(e) => {
                error!(device_id = %device.id, contact = %sender, error = %e, "Inference failed, sending apology");
                self.registry
                    .send_text(&device.id, &message.remote_jid, &self.fallback_reply)
                    .await?;
                Ok(RouteOutcome::Apologized)
            }
        }
    }
}
