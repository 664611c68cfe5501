use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use super::transport::{
    wait_for_ack, Acker, ConnectOptions, Handler, HandlerId, Transport, WsConnection, RECONNECT,
    RECONNECT_FAILED,
};
use crate::error::{ChatError, Result};
use crate::messages::{
    ClientEvent, MarkAsRead, MessagesRead, JOIN_ROOM, MESSAGES_READ, RECEIVE_MESSAGE,
    SEND_MESSAGE,
};
use crate::models::{AckResponse, Message, NewMessage};
use crate::room::resolve_room;
use crate::store::MessageStore;

const SESSION_EVENTS: [&str; 4] = [RECEIVE_MESSAGE, MESSAGES_READ, RECONNECT, RECONNECT_FAILED];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initializing,
    Joining,
    Active,
    TornDown,
}

/// Where a message stands from this client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Persisted, not yet handed to the transport.
    Sent,
    /// On the wire (outgoing) or received (incoming).
    Delivered,
    Acknowledged,
    Read,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message: Message,
    pub status: DeliveryStatus,
}

impl ChatEntry {
    pub fn is_delivered(&self) -> bool {
        !matches!(self.status, DeliveryStatus::Sent | DeliveryStatus::Failed(_))
    }

    fn is_same_message(&self, other: &Message) -> bool {
        self.message.id == other.id
            || (self.message.sender_id == other.sender_id
                && self.message.created_at == other.created_at)
    }
}

/// What applying one queued event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Received(String),
    Duplicate(String),
    Ignored,
    ReadReceipt(Vec<String>),
    Acknowledged(String),
    Failed { message_id: String, reason: String },
    Resynced,
    Offline,
}

enum SessionEvent {
    Received(Value, Option<Acker>),
    MessagesRead(Value),
    SendAcked { message_id: String, result: Result<()> },
    Reconnected,
    ReconnectFailed,
}

/// One open chat screen: a room between the current user and a recipient.
///
/// All state changes happen on the owner's task. Transport handlers only
/// queue events, which `next_event` / `process_pending` apply in arrival order.
pub struct ChatSession<S: MessageStore, T: Transport> {
    current_user: String,
    recipient: String,
    room_id: String,
    store: Arc<S>,
    transport: Arc<T>,
    owns_transport: bool,
    phase: SessionPhase,
    entries: Vec<ChatEntry>,
    read_requested: HashSet<String>,
    /// Registrations made by this session, removed on teardown.
    handlers: Vec<(&'static str, HandlerId)>,
    offline: bool,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<S: MessageStore> ChatSession<S, WsConnection> {
    /// Opens a dedicated connection that is closed on teardown.
    pub async fn connect(
        endpoint: &str,
        options: ConnectOptions,
        current_user: &str,
        recipient: &str,
        store: Arc<S>,
    ) -> Result<Self> {
        let connection = Arc::new(WsConnection::connect(endpoint, options).await?);
        Self::start(current_user, recipient, store, connection, true).await
    }
}

impl<S: MessageStore, T: Transport> ChatSession<S, T> {
    /// Opens a session over a connection the caller keeps owning.
    pub async fn open(
        current_user: &str,
        recipient: &str,
        store: Arc<S>,
        transport: Arc<T>,
    ) -> Result<Self> {
        Self::start(current_user, recipient, store, transport, false).await
    }

    async fn start(
        current_user: &str,
        recipient: &str,
        store: Arc<S>,
        transport: Arc<T>,
        owns_transport: bool,
    ) -> Result<Self> {
        if current_user.is_empty() || recipient.is_empty() {
            return Err(ChatError::Validation(
                "both participants are required".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = ChatSession {
            current_user: current_user.to_string(),
            recipient: recipient.to_string(),
            room_id: resolve_room(current_user, recipient),
            store,
            transport,
            owns_transport,
            phase: SessionPhase::Initializing,
            entries: Vec::new(),
            read_requested: HashSet::new(),
            handlers: Vec::new(),
            offline: false,
            events_tx,
            events_rx,
        };

        session.phase = SessionPhase::Joining;
        if let Err(e) = session.register_handlers() {
            session.teardown();
            return Err(e);
        }
        if let Err(e) = session.resume().await {
            session.teardown();
            return Err(e);
        }
        session.phase = SessionPhase::Active;
        info!("Chat session active in room {}", session.room_id);
        Ok(session)
    }

    fn register_handlers(&mut self) -> Result<()> {
        for event in SESSION_EVENTS {
            if self.transport.off(event) {
                debug!("Removed stale `{}` handler", event);
            }
        }

        let tx = self.events_tx.clone();
        self.subscribe(
            RECEIVE_MESSAGE,
            Arc::new(move |data: Value, acker: Option<Acker>| {
                let _ = tx.send(SessionEvent::Received(data, acker));
            }),
        )?;
        let tx = self.events_tx.clone();
        self.subscribe(
            MESSAGES_READ,
            Arc::new(move |data: Value, _: Option<Acker>| {
                let _ = tx.send(SessionEvent::MessagesRead(data));
            }),
        )?;
        let tx = self.events_tx.clone();
        self.subscribe(
            RECONNECT,
            Arc::new(move |_: Value, _: Option<Acker>| {
                let _ = tx.send(SessionEvent::Reconnected);
            }),
        )?;
        let tx = self.events_tx.clone();
        self.subscribe(
            RECONNECT_FAILED,
            Arc::new(move |_: Value, _: Option<Acker>| {
                let _ = tx.send(SessionEvent::ReconnectFailed);
            }),
        )
    }

    fn subscribe(&mut self, event: &'static str, handler: Handler) -> Result<()> {
        let id = self.transport.on(event, handler)?;
        self.handlers.push((event, id));
        Ok(())
    }

    /// Joins the room and rebuilds the thread from the store. Runs on open and
    /// after every reconnection, before any further live event is applied.
    pub async fn resume(&mut self) -> Result<()> {
        if self.phase == SessionPhase::TornDown {
            return Err(ChatError::Inactive);
        }

        let receiver = self.transport.join(&self.room_id)?;
        if let Err(e) = wait_for_ack(receiver, self.transport.ack_timeout(), JOIN_ROOM).await {
            error!("Joining room {} failed: {}", self.room_id, e);
            return Err(e);
        }

        let history = self.store.list_messages(&self.room_id).await?;
        self.hydrate(history);
        self.offline = false;
        self.read_requested.clear();
        self.track_reads();
        Ok(())
    }

    /// Rebuilds the thread from `history`. Held statuses survive, and failed
    /// sends the store does not return stay at the end so they remain visible.
    fn hydrate(&mut self, history: Vec<Message>) {
        let previous = std::mem::take(&mut self.entries);
        let mut statuses: HashMap<String, DeliveryStatus> = previous
            .iter()
            .map(|entry| (entry.message.id.clone(), entry.status.clone()))
            .collect();

        self.entries = history
            .into_iter()
            .map(|message| {
                let mine = message.sender_id == self.current_user;
                let status = match statuses.remove(&message.id) {
                    Some(_) if mine && message.is_read => DeliveryStatus::Read,
                    Some(status) => status,
                    None if mine && message.is_read => DeliveryStatus::Read,
                    None if mine => DeliveryStatus::Acknowledged,
                    None => DeliveryStatus::Delivered,
                };
                ChatEntry { message, status }
            })
            .collect();

        let unknown_failures: Vec<ChatEntry> = previous
            .into_iter()
            .filter(|entry| {
                statuses.contains_key(&entry.message.id)
                    && matches!(entry.status, DeliveryStatus::Failed(_))
            })
            .collect();
        if !unknown_failures.is_empty() {
            debug!(
                "Keeping {} failed message(s) missing from room {} history",
                unknown_failures.len(),
                self.room_id
            );
        }
        self.entries.extend(unknown_failures);
        debug!(
            "Room {} hydrated with {} message(s)",
            self.room_id,
            self.entries.len()
        );
    }

    /// Persists `text`, appends it optimistically, and emits it. Returns the
    /// new message id. Nothing is appended if persistence fails.
    pub async fn send(&mut self, text: &str) -> Result<String> {
        self.ensure_active()?;
        let draft = NewMessage::new(text, &self.room_id, &self.current_user, &self.recipient);
        draft.validate()?;

        let message = self.store.create_message(draft).await.map_err(|e| {
            error!("Failed to persist message in {}: {}", self.room_id, e);
            e
        })?;
        let message_id = message.id.clone();
        let payload = serde_json::to_value(&message)?;
        self.entries.push(ChatEntry {
            message,
            status: DeliveryStatus::Sent,
        });

        match self.transport.emit_with_ack(SEND_MESSAGE, payload) {
            Ok(receiver) => {
                self.set_status(&message_id, DeliveryStatus::Delivered);
                let tx = self.events_tx.clone();
                let timeout = self.transport.ack_timeout();
                let id = message_id.clone();
                tokio::spawn(async move {
                    let result = wait_for_ack(receiver, timeout, SEND_MESSAGE).await;
                    let _ = tx.send(SessionEvent::SendAcked {
                        message_id: id,
                        result,
                    });
                });
            }
            Err(e) => {
                warn!("Message {} was stored but not emitted: {}", message_id, e);
                self.set_status(&message_id, DeliveryStatus::Failed(e.to_string()));
            }
        }
        Ok(message_id)
    }

    /// Waits for the next queued event and applies it.
    pub async fn next_event(&mut self) -> Result<SessionUpdate> {
        self.ensure_not_torn_down()?;
        match self.events_rx.recv().await {
            Some(event) => self.apply(event).await,
            None => Err(ChatError::Inactive),
        }
    }

    /// Applies everything already queued without waiting.
    pub async fn process_pending(&mut self) -> Result<Vec<SessionUpdate>> {
        self.ensure_not_torn_down()?;
        let mut updates = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            updates.push(self.apply(event).await?);
        }
        Ok(updates)
    }

    async fn apply(&mut self, event: SessionEvent) -> Result<SessionUpdate> {
        match event {
            SessionEvent::Received(data, acker) => Ok(self.receive(data, acker)),
            SessionEvent::MessagesRead(data) => Ok(self.apply_read_receipt(data)),
            SessionEvent::SendAcked { message_id, result } => {
                Ok(self.apply_send_ack(message_id, result))
            }
            SessionEvent::Reconnected => {
                info!("Reconnected, resyncing room {}", self.room_id);
                self.resume().await?;
                Ok(SessionUpdate::Resynced)
            }
            SessionEvent::ReconnectFailed => {
                warn!(
                    "Connection offline, room {} keeps its last snapshot",
                    self.room_id
                );
                self.offline = true;
                Ok(SessionUpdate::Offline)
            }
        }
    }

    fn receive(&mut self, data: Value, acker: Option<Acker>) -> SessionUpdate {
        let message: Message = match serde_json::from_value(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message in {}: {}", self.room_id, e);
                if let Some(acker) = acker {
                    acker.send(AckResponse::failed("malformed message"));
                }
                return SessionUpdate::Ignored;
            }
        };

        if message.room_id != self.room_id {
            debug!("Ignoring message for room {}", message.room_id);
            if let Some(acker) = acker {
                acker.send(AckResponse::failed("wrong room"));
            }
            return SessionUpdate::Ignored;
        }

        let duplicate = self.entries.iter().any(|e| e.is_same_message(&message));
        if let Some(acker) = acker {
            acker.send(AckResponse::ok());
        }
        if duplicate {
            return SessionUpdate::Duplicate(message.id);
        }

        let id = message.id.clone();
        self.entries.push(ChatEntry {
            message,
            status: DeliveryStatus::Delivered,
        });
        self.track_reads();
        SessionUpdate::Received(id)
    }

    fn apply_read_receipt(&mut self, data: Value) -> SessionUpdate {
        let receipt: MessagesRead = match serde_json::from_value(data) {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Malformed read receipt in {}: {}", self.room_id, e);
                return SessionUpdate::Ignored;
            }
        };
        let ids: HashSet<&str> = receipt.message_ids.iter().map(String::as_str).collect();

        let mut flipped = Vec::new();
        for entry in &mut self.entries {
            if !ids.contains(entry.message.id.as_str()) {
                continue;
            }
            if !entry.message.is_read {
                entry.message.is_read = true;
                flipped.push(entry.message.id.clone());
            }
            if entry.message.sender_id == self.current_user {
                entry.status = DeliveryStatus::Read;
            }
        }
        SessionUpdate::ReadReceipt(flipped)
    }

    fn apply_send_ack(&mut self, message_id: String, result: Result<()>) -> SessionUpdate {
        let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == message_id) else {
            return SessionUpdate::Ignored;
        };
        match result {
            Ok(()) => {
                if matches!(entry.status, DeliveryStatus::Sent | DeliveryStatus::Delivered) {
                    entry.status = DeliveryStatus::Acknowledged;
                }
                SessionUpdate::Acknowledged(message_id)
            }
            Err(e) => {
                error!("Message {} was not acknowledged: {}", message_id, e);
                let reason = e.to_string();
                if entry.status != DeliveryStatus::Read {
                    entry.status = DeliveryStatus::Failed(reason.clone());
                }
                SessionUpdate::Failed { message_id, reason }
            }
        }
    }

    /// Emits `mark_as_read` for the peer's unread messages not yet requested.
    fn track_reads(&mut self) {
        let unread: Vec<String> = self
            .unread_from_peer()
            .into_iter()
            .filter(|m| !self.read_requested.contains(&m.id))
            .map(|m| m.id.clone())
            .collect();
        if unread.is_empty() {
            return;
        }

        let frame = ClientEvent::MarkAsRead(MarkAsRead {
            room_id: self.room_id.clone(),
            message_ids: unread.clone(),
        })
        .into_frame();
        match self.transport.emit(&frame.event, frame.data) {
            Ok(()) => self.read_requested.extend(unread),
            Err(e) => warn!("Could not mark messages read in {}: {}", self.room_id, e),
        }
    }

    /// Messages from the other participant that are still unread.
    pub fn unread_from_peer(&self) -> Vec<&Message> {
        self.entries
            .iter()
            .map(|e| &e.message)
            .filter(|m| m.sender_id != self.current_user && !m.is_read)
            .collect()
    }

    fn set_status(&mut self, message_id: &str, status: DeliveryStatus) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == message_id) {
            entry.status = status;
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.phase == SessionPhase::Active {
            Ok(())
        } else {
            Err(ChatError::Inactive)
        }
    }

    fn ensure_not_torn_down(&self) -> Result<()> {
        if self.phase == SessionPhase::TornDown {
            Err(ChatError::Inactive)
        } else {
            Ok(())
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn messages(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn entry(&self, message_id: &str) -> Option<&ChatEntry> {
        self.entries.iter().find(|e| e.message.id == message_id)
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Unregisters this session's handlers, leaves the room unless a newer
    /// session took it over, and closes an owned connection. Runs once; `Drop`
    /// calls it for exit paths that skip it.
    pub fn teardown(&mut self) {
        if self.phase == SessionPhase::TornDown {
            return;
        }
        // A newer session on the same connection may have taken the room over.
        let mut owns_room = false;
        for (event, id) in self.handlers.drain(..) {
            if self.transport.off_if(event, id) && event == RECEIVE_MESSAGE {
                owns_room = true;
            }
        }
        if owns_room {
            if let Err(e) = self.transport.leave(&self.room_id) {
                debug!("Leave for {} not sent: {}", self.room_id, e);
            }
        } else {
            debug!("Room {} handed to a newer session, staying joined", self.room_id);
        }
        if self.owns_transport {
            self.transport.close();
        }
        self.phase = SessionPhase::TornDown;
        info!("Chat session for room {} torn down", self.room_id);
    }
}

impl<S: MessageStore, T: Transport> Drop for ChatSession<S, T> {
    fn drop(&mut self) {
        self.teardown();
    }
}
