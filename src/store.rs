use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{Conversation, Message, NewMessage, Notification, NotificationKind};
use crate::room::resolve_room;

/// Durable record of conversations and messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages of a room, oldest first.
    async fn list_messages(&self, room_id: &str) -> Result<Vec<Message>>;

    /// Persists a message and refreshes the pair's conversation.
    /// Fails with `Validation` before touching storage if a field is missing.
    async fn create_message(&self, draft: NewMessage) -> Result<Message>;

    /// Idempotent. Unknown ids are ignored.
    async fn mark_read(&self, message_ids: &[String]) -> Result<()>;

    /// Conversations `user_id` takes part in, most recent first.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Most recent first.
    async fn list_notifications(&self) -> Result<Vec<Notification>>;
    async fn unseen_count(&self) -> Result<u64>;
    async fn mark_all_seen(&self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    rooms: HashMap<String, Vec<Message>>,
    #[serde(default)]
    conversations: HashMap<String, Conversation>,
    /// Newest first.
    #[serde(default)]
    notifications: Vec<Notification>,
}

/// Server-side store. Lives in memory and, when opened with a path, rewrites a
/// JSON snapshot after every mutation.
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    snapshot_path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: RwLock::new(Snapshot::default()),
            snapshot_path: None,
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let snapshot = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Snapshot::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Store opened at {} ({} rooms, {} notifications)",
            path.display(),
            snapshot.rooms.len(),
            snapshot.notifications.len()
        );

        Ok(MemoryStore {
            state: RwLock::new(snapshot),
            snapshot_path: Some(path),
        })
    }

    async fn flush(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(snapshot)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        debug!("Snapshot written to {}", path.display());
        Ok(())
    }

    /// Applies `change` to a copy of the state and publishes it only once the
    /// copy is on disk, so a failed write leaves memory and disk in step.
    async fn update<R>(&self, change: impl FnOnce(&mut Snapshot) -> R) -> Result<R> {
        let mut state = self.state.write().await;
        if self.snapshot_path.is_none() {
            return Ok(change(&mut state));
        }
        let mut next = state.clone();
        let out = change(&mut next);
        self.flush(&next).await?;
        *state = next;
        Ok(out)
    }

    /// Records a domain event for the admin dashboard.
    pub async fn create_notification(
        &self,
        kind: NotificationKind,
        message: String,
        details: Map<String, Value>,
    ) -> Result<Notification> {
        let notification = Notification::new(kind, message, details);
        self.update(|state| state.notifications.insert(0, notification.clone()))
            .await
            .inspect_err(|e| warn!("Failed to persist notification {}: {}", notification.id, e))?;
        Ok(notification)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn list_messages(&self, room_id: &str) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        Ok(state.rooms.get(room_id).cloned().unwrap_or_default())
    }

    async fn create_message(&self, draft: NewMessage) -> Result<Message> {
        draft.validate()?;
        let message = draft.into_message();

        self.update(|state| {
            state
                .rooms
                .entry(message.room_id.clone())
                .or_default()
                .push(message.clone());

            let key = resolve_room(&message.sender_id, &message.receiver_id);
            let conversation = state
                .conversations
                .entry(key)
                .or_insert_with(|| {
                    let mut participants =
                        vec![message.sender_id.clone(), message.receiver_id.clone()];
                    participants.sort();
                    participants.dedup();
                    Conversation {
                        id: uuid::Uuid::new_v4().to_string(),
                        participants,
                        last_message: String::new(),
                        last_message_at: message.created_at,
                    }
                });
            conversation.last_message.clone_from(&message.text);
            conversation.last_message_at = message.created_at;
        })
        .await
        .inspect_err(|e| warn!("Failed to persist message {}: {}", message.id, e))?;
        Ok(message)
    }

    async fn mark_read(&self, message_ids: &[String]) -> Result<()> {
        let wanted: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let unread = |m: &Message| !m.is_read && wanted.contains(m.id.as_str());
        if !self.state.read().await.rooms.values().flatten().any(unread) {
            return Ok(());
        }
        self.update(|state| {
            for message in state.rooms.values_mut().flatten() {
                if unread(&*message) {
                    message.is_read = true;
                }
            }
        })
        .await
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.includes(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn list_notifications(&self) -> Result<Vec<Notification>> {
        Ok(self.state.read().await.notifications.clone())
    }

    async fn unseen_count(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.notifications.iter().filter(|n| !n.seen).count() as u64)
    }

    async fn mark_all_seen(&self) -> Result<()> {
        self.update(|state| {
            for notification in &mut state.notifications {
                notification.seen = true;
            }
        })
        .await
    }
}
