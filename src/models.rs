use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub text: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub text: String,
    #[serde(default)]
    pub is_read: bool,
    pub room_id: String,
    pub sender_id: String,
    pub receiver_id: String,
}

impl NewMessage {
    pub fn new(text: &str, room_id: &str, sender_id: &str, receiver_id: &str) -> Self {
        NewMessage {
            text: text.to_string(),
            is_read: false,
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(ChatError::Validation("message text is empty".to_string()));
        }
        for (field, value) in [
            ("roomId", &self.room_id),
            ("senderId", &self.sender_id),
            ("receiverId", &self.receiver_id),
        ] {
            if value.is_empty() {
                return Err(ChatError::Validation(format!("{field} is missing")));
            }
        }
        Ok(())
    }

    pub fn into_message(self) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            room_id: self.room_id,
            text: self.text,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            is_read: self.is_read,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Always two ids, sorted.
    pub participants: Vec<String>,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    pub fn includes(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "donation")]
    Donation,
    #[serde(rename = "inNeed")]
    InNeed,
}

impl NotificationKind {
    /// Name of the socket event the broadcast group receives.
    pub fn event_name(self) -> &'static str {
        match self {
            NotificationKind::Donation => "new_donation_notification",
            NotificationKind::InNeed => "new_inNeed_notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
    /// Domain fields of the donation / in-need item. Kept under their own key
    /// so an item field can never shadow `id`, `kind` or `seen`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: String, details: Map<String, Value>) -> Self {
        Notification {
            id: Uuid::new_v4().to_string(),
            kind,
            message,
            created_at: Utc::now(),
            seen: false,
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckResponse {
    pub fn ok() -> Self {
        AckResponse {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        AckResponse {
            success: false,
            error: Some(error.into()),
        }
    }

    /// Turns a negative ack into an `AckFailure` for `event`.
    pub fn into_result(self, event: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(ChatError::ack_failure(
                event,
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_uses_camel_case_on_the_wire() {
        let message = NewMessage::new("hello", "alice-bob", "alice", "bob").into_message();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["roomId"], "alice-bob");
        assert_eq!(value["senderId"], "alice");
        assert_eq!(value["isRead"], false);
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn blank_text_is_rejected() {
        let err = NewMessage::new("   ", "a-b", "a", "b").validate().unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        let err = NewMessage::new("hi", "a-b", "", "b").validate().unwrap_err();
        assert_eq!(err, ChatError::Validation("senderId is missing".to_string()));
    }

    #[test]
    fn notification_keeps_domain_fields() {
        let raw = json!({
            "id": "n1",
            "kind": "inNeed",
            "message": "New in-need request",
            "createdAt": "2024-05-01T10:00:00Z",
            "details": { "title": "Winter coats", "quantity": 12 }
        });
        let notification: Notification = serde_json::from_value(raw).unwrap();
        assert_eq!(notification.kind, NotificationKind::InNeed);
        assert!(!notification.seen);
        assert_eq!(notification.details["quantity"], 12);
    }

    #[test]
    fn item_fields_cannot_shadow_notification_fields() {
        let mut details = Map::new();
        details.insert("id".to_string(), json!("donation-42"));
        details.insert("seen".to_string(), json!("yes"));
        details.insert("kind".to_string(), json!("other"));
        let notification = Notification::new(NotificationKind::Donation, "New".to_string(), details);

        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["id"], notification.id.as_str());
        assert_eq!(value["kind"], "donation");
        assert_eq!(value["seen"], false);
        assert_eq!(value["details"]["id"], "donation-42");

        let back: Notification = serde_json::from_value(value).unwrap();
        assert_eq!(back, notification);
    }

    #[test]
    fn negative_ack_becomes_ack_failure() {
        let err = AckResponse::failed("room not joined")
            .into_result("send_message")
            .unwrap_err();
        assert_eq!(
            err,
            ChatError::ack_failure("send_message", "room not joined")
        );
    }
}
