//! Inbound event shapes.
//!
//! Transports convert their native payloads into `RawInboundEvent`. Once
//! admitted, the event becomes an `InboundMessage` routed to a conversation.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Raw event as handed over by a transport.
///
/// Only a subset of fields is needed: something identifying the sender, and
/// either a native message id or a timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInboundEvent {
    /// Transport-native message id, when the transport provides one.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Source channel: "whatsapp", "telegram", "email", ...
    #[serde(default)]
    pub channel: String,
    /// Chat or thread the event belongs to (group chats, threads).
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Sender address (phone number, handle, email address).
    #[serde(default)]
    pub sender: Option<String>,
    /// Human-readable sender name.
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Unix timestamp in seconds, as reported by the transport.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Message text.
    #[serde(default)]
    pub body: Option<String>,
    /// Set by transports that flag messages sent by this account.
    #[serde(default)]
    pub from_me: bool,
    /// Anything else the transport wants to carry through.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RawInboundEvent {
    /// Conversation the event is routed to: the chat id when present,
    /// otherwise the sender.
    pub fn conversation_id(&self) -> Option<String> {
        non_blank(self.chat_id.as_deref()).or_else(|| non_blank(self.sender.as_deref()))
    }

    /// Trimmed sender, if any.
    pub fn sender(&self) -> Option<String> {
        non_blank(self.sender.as_deref())
    }

    /// Build the message handed to processors.
    pub fn into_message(self, event_key: String, conversation_id: String) -> InboundMessage {
        let received_at = self
            .timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);
        let sender = self.sender().unwrap_or_else(|| conversation_id.clone());

        InboundMessage {
            id: event_key,
            conversation_id,
            channel: self.channel,
            sender,
            sender_name: self.sender_name,
            content: self.body.unwrap_or_default(),
            received_at,
            metadata: self.metadata,
        }
    }
}

/// Message routed to a conversation and handed to a processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Event key assigned at admission.
    pub id: String,
    pub conversation_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl InboundMessage {
    /// Minimal message, mostly for hosts that bypass the deduplicator.
    pub fn new(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: conversation_id.clone(),
            conversation_id,
            channel: String::new(),
            sender_name: None,
            content: content.into(),
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_prefers_chat_id() {
        let event = RawInboundEvent {
            chat_id: Some("group-1".into()),
            sender: Some("+15550001".into()),
            ..Default::default()
        };
        assert_eq!(event.conversation_id().as_deref(), Some("group-1"));
    }

    #[test]
    fn conversation_falls_back_to_sender() {
        let event = RawInboundEvent {
            chat_id: Some("  ".into()),
            sender: Some(" +15550001 ".into()),
            ..Default::default()
        };
        assert_eq!(event.conversation_id().as_deref(), Some("+15550001"));
        assert!(RawInboundEvent::default().conversation_id().is_none());
    }

    #[test]
    fn deserializes_sparse_payload() {
        let event: RawInboundEvent = serde_json::from_value(serde_json::json!({
            "sender": "alice",
            "body": "hi",
            "timestamp": 1_700_000_000
        }))
        .unwrap();
        assert!(!event.from_me);
        assert!(event.message_id.is_none());

        let message = event.into_message("k1".into(), "alice".into());
        assert_eq!(message.content, "hi");
        assert_eq!(message.received_at.timestamp(), 1_700_000_000);
    }
}
