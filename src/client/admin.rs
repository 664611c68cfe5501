use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::mpsc;

use super::transport::{Acker, HandlerId, Transport};
use crate::error::{ChatError, Result};
use crate::messages::{JOIN_ADMIN_DASHBOARD, LEAVE_ADMIN_DASHBOARD};
use crate::models::{Notification, NotificationKind};
use crate::store::NotificationStore;

const FEED_EVENTS: [NotificationKind; 2] = [NotificationKind::Donation, NotificationKind::InNeed];

/// Fetches tried before falling back to merging with live state.
const STABLE_FETCH_ATTEMPTS: u32 = 3;

/// What the dashboard keeps between launches. Both fields are always written
/// together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedFeed {
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub unseen_count: u64,
}

/// Local cache of the notification list and unseen count, one JSON file.
#[derive(Debug, Clone)]
pub struct NotificationCache {
    path: PathBuf,
}

impl NotificationCache {
    pub fn new(path: impl AsRef<Path>) -> Self {
        NotificationCache {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// A missing or unreadable cache loads as empty.
    pub async fn load(&self) -> CachedFeed {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding corrupt cache {}: {}", self.path.display(), e);
                CachedFeed::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CachedFeed::default(),
            Err(e) => {
                warn!("Failed to read cache {}: {}", self.path.display(), e);
                CachedFeed::default()
            }
        }
    }

    pub async fn save(&self, feed: &CachedFeed) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(feed)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Transient banner for a freshly pushed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub kind: NotificationKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUpdate {
    Notified(Toast),
    /// Already known, for example because a fetch returned it first.
    Duplicate(String),
    Ignored,
}

struct Pushed {
    kind: NotificationKind,
    data: Value,
}

/// One admin dashboard session's view of the notification broadcast group.
/// Each feed owns its unseen counter.
pub struct AdminFeed<S: NotificationStore, T: Transport> {
    store: Arc<S>,
    transport: Arc<T>,
    cache: NotificationCache,
    state: CachedFeed,
    /// Bumped by the handlers the moment a push arrives.
    live_seq: Arc<AtomicU64>,
    handlers: Vec<(NotificationKind, HandlerId)>,
    events_tx: mpsc::UnboundedSender<Pushed>,
    events_rx: mpsc::UnboundedReceiver<Pushed>,
    closed: bool,
}

impl<S: NotificationStore, T: Transport> AdminFeed<S, T> {
    /// Joins the broadcast group, registers the push handlers, then loads the
    /// server's list and count. A failed fetch leaves the cached snapshot.
    pub async fn open(store: Arc<S>, transport: Arc<T>, cache: NotificationCache) -> Result<Self> {
        let state = cache.load().await;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut feed = AdminFeed {
            store,
            transport,
            cache,
            state,
            live_seq: Arc::new(AtomicU64::new(0)),
            handlers: Vec::new(),
            events_tx,
            events_rx,
            closed: false,
        };

        feed.transport.emit(JOIN_ADMIN_DASHBOARD, Value::Null)?;
        if let Err(e) = feed.register_handlers() {
            feed.close();
            return Err(e);
        }
        if let Err(e) = feed.refresh().await {
            warn!("Initial notification fetch failed, showing cached state: {}", e);
        }
        info!(
            "Admin feed open with {} unseen notification(s)",
            feed.state.unseen_count
        );
        Ok(feed)
    }

    fn register_handlers(&mut self) -> Result<()> {
        for kind in FEED_EVENTS {
            let event = kind.event_name();
            if self.transport.off(event) {
                debug!("Removed stale `{}` handler", event);
            }
            let tx = self.events_tx.clone();
            let live_seq = Arc::clone(&self.live_seq);
            let id = self.transport.on(
                event,
                Arc::new(move |data: Value, _: Option<Acker>| {
                    live_seq.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(Pushed { kind, data });
                }),
            )?;
            self.handlers.push((kind, id));
        }
        Ok(())
    }

    /// Re-reads list and count from the server.
    ///
    /// A fetch that no push overlapped replaces the local view: every push
    /// queued so far was recorded server side first, so it is already in the
    /// fetched list and applies as a duplicate. When pushes keep overlapping,
    /// the last fetch is merged instead, local entries first, and the count
    /// grows by the fetched unseen entries this feed did not hold yet.
    pub async fn refresh(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut attempt = 1;
        loop {
            let started_at = self.live_seq.load(Ordering::SeqCst);
            let unseen_count = self.store.unseen_count().await?;
            let notifications = self.store.list_notifications().await?;
            if self.live_seq.load(Ordering::SeqCst) == started_at {
                self.state = CachedFeed {
                    notifications,
                    unseen_count,
                };
                break;
            }
            if attempt == STABLE_FETCH_ATTEMPTS {
                debug!("Pushes kept arriving during fetch, merging");
                self.merge(notifications, unseen_count);
                break;
            }
            debug!("Push arrived during fetch {}, fetching again", attempt);
            attempt += 1;
        }
        self.persist().await
    }

    fn merge(&mut self, fetched: Vec<Notification>, fetched_unseen: u64) {
        let known: HashSet<String> =
            self.state.notifications.iter().map(|n| n.id.clone()).collect();
        let fresh: Vec<Notification> = fetched
            .into_iter()
            .filter(|n| !known.contains(&n.id))
            .collect();
        let fresh_unseen = fresh.iter().filter(|n| !n.seen).count() as u64;
        self.state.notifications.extend(fresh);
        self.state.unseen_count = fetched_unseen.max(self.state.unseen_count + fresh_unseen);
    }

    /// Waits for the next push and applies it.
    pub async fn next_event(&mut self) -> Result<FeedUpdate> {
        self.ensure_open()?;
        match self.events_rx.recv().await {
            Some(pushed) => self.apply(pushed).await,
            None => Err(ChatError::Inactive),
        }
    }

    /// Applies every push already queued.
    pub async fn process_pending(&mut self) -> Result<Vec<FeedUpdate>> {
        self.ensure_open()?;
        let mut updates = Vec::new();
        while let Ok(pushed) = self.events_rx.try_recv() {
            updates.push(self.apply(pushed).await?);
        }
        Ok(updates)
    }

    async fn apply(&mut self, pushed: Pushed) -> Result<FeedUpdate> {
        let notification: Notification = match serde_json::from_value(pushed.data) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Malformed `{}` payload: {}", pushed.kind.event_name(), e);
                return Ok(FeedUpdate::Ignored);
            }
        };
        if self.state.notifications.iter().any(|n| n.id == notification.id) {
            return Ok(FeedUpdate::Duplicate(notification.id));
        }

        let toast = Toast {
            kind: pushed.kind,
            message: notification.message.clone(),
        };
        self.state.notifications.insert(0, notification);
        self.state.unseen_count += 1;
        self.persist().await?;
        info!("Notification: {}", toast.message);
        Ok(FeedUpdate::Notified(toast))
    }

    /// The only way the unseen count goes down.
    pub async fn mark_all_seen(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.store.mark_all_seen().await?;
        for notification in &mut self.state.notifications {
            notification.seen = true;
        }
        self.state.unseen_count = 0;
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        self.cache.save(&self.state).await.map_err(|e| {
            warn!("Failed to persist notification cache: {}", e);
            e
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ChatError::Inactive)
        } else {
            Ok(())
        }
    }

    pub fn unseen_count(&self) -> u64 {
        self.state.unseen_count
    }

    /// Most recent first.
    pub fn notifications(&self) -> &[Notification] {
        &self.state.notifications
    }

    /// Unregisters this feed's push handlers and leaves the broadcast group
    /// unless a newer feed on the same connection took it over.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        // Another feed on the same connection may have taken the group over.
        let mut owns_group = false;
        for (kind, id) in self.handlers.drain(..) {
            owns_group |= self.transport.off_if(kind.event_name(), id);
        }
        if owns_group {
            if let Err(e) = self.transport.emit(LEAVE_ADMIN_DASHBOARD, Value::Null) {
                debug!("Leave for admin dashboard not sent: {}", e);
            }
        }
        self.closed = true;
    }
}

impl<S: NotificationStore, T: Transport> Drop for AdminFeed<S, T> {
    fn drop(&mut self) {
        self.close();
    }
}
