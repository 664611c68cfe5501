use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{AckResponse, Message, Notification};

pub const ACK_EVENT: &str = "ack";

pub const JOIN_ADMIN_DASHBOARD: &str = "join_admin_dashboard";
pub const LEAVE_ADMIN_DASHBOARD: &str = "leave_admin_dashboard";
pub const JOIN_ROOM: &str = "join_room";
pub const LEAVE_ROOM: &str = "leave_room";
pub const SEND_MESSAGE: &str = "send_message";
pub const RECEIVE_MESSAGE: &str = "receive_message";
pub const MARK_AS_READ: &str = "mark_as_read";
pub const MESSAGES_READ: &str = "messages_read";

/// Envelope of every frame on the socket: `{"event", "data", "ack"?}`.
/// A frame carrying `ack` asks the other side to answer with an `ack` frame
/// holding the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn new(event: &str, data: Value) -> Self {
        Frame {
            event: event.to_string(),
            data,
            ack: None,
        }
    }

    #[must_use]
    pub fn with_ack(mut self, ack_id: u64) -> Self {
        self.ack = Some(ack_id);
        self
    }

    pub fn ack_reply(ack_id: u64, response: &AckResponse) -> Self {
        Frame {
            event: ACK_EVENT.to_string(),
            data: serde_json::to_value(response).unwrap_or(Value::Null),
            ack: Some(ack_id),
        }
    }

    pub fn is_ack_reply(&self) -> bool {
        self.event == ACK_EVENT
    }

    /// Payload of an `ack` frame. Anything unparseable counts as a failure.
    pub fn ack_response(&self) -> AckResponse {
        serde_json::from_value(self.data.clone())
            .unwrap_or_else(|_| AckResponse::failed("malformed ack"))
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsRead {
    pub room_id: String,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesRead {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join_admin_dashboard")]
    JoinAdminDashboard,
    #[serde(rename = "leave_admin_dashboard")]
    LeaveAdminDashboard,
    #[serde(rename = "join_room")]
    JoinRoom(String),
    #[serde(rename = "leave_room")]
    LeaveRoom(String),
    #[serde(rename = "send_message")]
    SendMessage(Message),
    #[serde(rename = "mark_as_read")]
    MarkAsRead(MarkAsRead),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "receive_message")]
    ReceiveMessage(Message),
    #[serde(rename = "messages_read")]
    MessagesRead(MessagesRead),
    #[serde(rename = "new_donation_notification")]
    NewDonationNotification(Notification),
    #[serde(rename = "new_inNeed_notification")]
    NewInNeedNotification(Notification),
}

impl ClientEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, serde_json::Error> {
        from_envelope(frame)
    }

    pub fn into_frame(self) -> Frame {
        into_envelope(&self)
    }
}

impl ServerEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, serde_json::Error> {
        from_envelope(frame)
    }

    pub fn into_frame(self) -> Frame {
        into_envelope(&self)
    }
}

fn from_envelope<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T, serde_json::Error> {
    let envelope = if frame.data.is_null() {
        json!({ "event": frame.event })
    } else {
        json!({ "event": frame.event, "data": frame.data })
    };
    serde_json::from_value(envelope)
}

fn into_envelope<T: Serialize>(event: &T) -> Frame {
    let mut value = serde_json::to_value(event).unwrap_or(Value::Null);
    let name = value["event"].as_str().unwrap_or_default().to_string();
    let data = value
        .as_object_mut()
        .and_then(|object| object.remove("data"))
        .unwrap_or(Value::Null);
    Frame::new(&name, data)
}
