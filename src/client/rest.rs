use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ChatError, Result};
use crate::models::{Conversation, Message, NewMessage, Notification};
use crate::store::{MessageStore, NotificationStore};

#[derive(Deserialize)]
struct CountReply {
    count: u64,
}

/// Store backed by the relay's REST surface.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: Client,
    base_url: String,
}

impl RestStore {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        RestStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = check(response).await?;
        Ok(response.json().await?)
    }
}

/// Maps non-2xx replies onto the error taxonomy, taking the server's
/// `{"error": ...}` body when there is one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let reason = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    debug!("{} answered {}: {}", url, status, reason);

    if status == StatusCode::BAD_REQUEST {
        Err(ChatError::Validation(reason))
    } else {
        Err(ChatError::Store(format!("{status}: {reason}")))
    }
}

#[async_trait]
impl MessageStore for RestStore {
    async fn list_messages(&self, room_id: &str) -> Result<Vec<Message>> {
        let response = self
            .client
            .get(self.url(&format!("message/room/{room_id}")))
            .send()
            .await?;
        Self::read(response).await
    }

    async fn create_message(&self, draft: NewMessage) -> Result<Message> {
        draft.validate()?;
        let response = self
            .client
            .post(self.url("message"))
            .json(&draft)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn mark_read(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .patch(self.url("message/read"))
            .json(&json!({ "messageIds": message_ids }))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let response = self
            .client
            .get(self.url(&format!("conversation/{user_id}")))
            .send()
            .await?;
        Self::read(response).await
    }
}

#[async_trait]
impl NotificationStore for RestStore {
    async fn list_notifications(&self) -> Result<Vec<Notification>> {
        let response = self
            .client
            .get(self.url("notification/GetAllnotification"))
            .send()
            .await?;
        Self::read(response).await
    }

    async fn unseen_count(&self) -> Result<u64> {
        let response = self
            .client
            .get(self.url("notification/unseen-count"))
            .send()
            .await?;
        let reply: CountReply = Self::read(response).await?;
        Ok(reply.count)
    }

    async fn mark_all_seen(&self) -> Result<()> {
        let response = self
            .client
            .patch(self.url("notification/mark-all-seen"))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }
}
