use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::error::Result;
use crate::messages::{ClientEvent, Frame, MarkAsRead, MessagesRead, ServerEvent};
use crate::models::{AckResponse, Message as ChatMessage, Notification, NotificationKind};
use crate::room::Room;
use crate::store::{MemoryStore, MessageStore};

type Rooms = Arc<RwLock<HashMap<String, Room>>>;
type Connections = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Frame>>>>;

/// Delivery acks we asked a client for: ack id -> (connection, message id).
type PendingAcks = Arc<RwLock<HashMap<u64, (String, String)>>>;

#[derive(Clone)]
pub struct Server {
    rooms: Rooms,
    admins: Arc<RwLock<Room>>,
    connections: Connections,
    pending_acks: PendingAcks,
    next_ack: Arc<AtomicU64>,
    store: Arc<MemoryStore>,
}

impl Server {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Server {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            admins: Arc::new(RwLock::new(Room::default())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            pending_acks: Arc::new(RwLock::new(HashMap::new())),
            next_ack: Arc::new(AtomicU64::new(1)),
            store,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let (connection_id, mut rx) = self.register_connection().await;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let writer_id = connection_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode `{}` for {}: {}", frame.event, writer_id, e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    warn!("Failed to send WebSocket message to {}: {}", writer_id, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    if msg.is_close() {
                        break;
                    }
                    let Ok(text) = msg.to_str() else {
                        continue;
                    };
                    match Frame::parse(text) {
                        Ok(frame) => self.handle_frame(&connection_id, frame).await,
                        Err(e) => warn!("Malformed frame from {}: {}", connection_id, e),
                    }
                }
                Err(e) => {
                    error!("WebSocket error on {}: {}", connection_id, e);
                    break;
                }
            }
        }

        self.handle_disconnect(&connection_id).await;
    }

    /// Adds a connection and returns its id plus the queue of frames to write to it.
    pub async fn register_connection(&self) -> (String, mpsc::UnboundedReceiver<Frame>) {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .await
            .insert(connection_id.clone(), tx);
        info!("Connection {} opened", connection_id);
        (connection_id, rx)
    }

    pub async fn handle_frame(&self, connection_id: &str, frame: Frame) {
        if frame.is_ack_reply() {
            self.handle_client_ack(connection_id, &frame).await;
            return;
        }

        match ClientEvent::from_frame(&frame) {
            Ok(event) => self.handle_client_event(connection_id, event, frame.ack).await,
            Err(e) => {
                warn!(
                    "Ignoring `{}` from {}: {}",
                    frame.event, connection_id, e
                );
                self.reply(
                    connection_id,
                    frame.ack,
                    AckResponse::failed(format!("unsupported event `{}`", frame.event)),
                )
                .await;
            }
        }
    }

    async fn handle_client_event(&self, connection_id: &str, event: ClientEvent, ack: Option<u64>) {
        match event {
            ClientEvent::JoinAdminDashboard => {
                self.admins.write().await.add_member(connection_id);
                info!("{} joined the admin dashboard", connection_id);
                self.reply(connection_id, ack, AckResponse::ok()).await;
            }

            ClientEvent::LeaveAdminDashboard => {
                self.admins.write().await.remove_member(connection_id);
                self.reply(connection_id, ack, AckResponse::ok()).await;
            }

            ClientEvent::JoinRoom(room_id) => {
                if room_id.is_empty() {
                    self.reply(connection_id, ack, AckResponse::failed("room id is required"))
                        .await;
                    return;
                }
                let added = self
                    .rooms
                    .write()
                    .await
                    .entry(room_id.clone())
                    .or_default()
                    .add_member(connection_id);
                if added {
                    info!("{} joined room {}", connection_id, room_id);
                }
                self.reply(connection_id, ack, AckResponse::ok()).await;
            }

            ClientEvent::LeaveRoom(room_id) => {
                self.leave_room(connection_id, &room_id).await;
                self.reply(connection_id, ack, AckResponse::ok()).await;
            }

            ClientEvent::SendMessage(message) => {
                self.relay_message(connection_id, message, ack).await;
            }

            ClientEvent::MarkAsRead(request) => {
                let response = self.mark_as_read(connection_id, request).await;
                self.reply(connection_id, ack, response).await;
            }
        }
    }

    async fn relay_message(&self, connection_id: &str, message: ChatMessage, ack: Option<u64>) {
        if message.text.trim().is_empty() || message.sender_id.is_empty() {
            self.reply(connection_id, ack, AckResponse::failed("message is incomplete"))
                .await;
            return;
        }

        if !self.is_member(connection_id, &message.room_id).await {
            warn!(
                "{} sent to room {} without joining it",
                connection_id, message.room_id
            );
            self.reply(
                connection_id,
                ack,
                AckResponse::failed(format!("not joined to room {}", message.room_id)),
            )
            .await;
            return;
        }

        self.reply(connection_id, ack, AckResponse::ok()).await;

        let room_id = message.room_id.clone();
        let message_id = message.id.clone();
        let frame = ServerEvent::ReceiveMessage(message).into_frame();
        for member in self.room_members(&room_id).await {
            let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed);
            self.pending_acks
                .write()
                .await
                .insert(ack_id, (member.clone(), message_id.clone()));
            self.send_to(&member, frame.clone().with_ack(ack_id)).await;
        }
    }

    async fn is_member(&self, connection_id: &str, room_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|room| room.contains(connection_id))
    }

    async fn mark_as_read(&self, connection_id: &str, request: MarkAsRead) -> AckResponse {
        if !self.is_member(connection_id, &request.room_id).await {
            warn!(
                "{} marked messages read in room {} without joining it",
                connection_id, request.room_id
            );
            return AckResponse::failed(format!("not joined to room {}", request.room_id));
        }
        if request.message_ids.is_empty() {
            return AckResponse::ok();
        }
        if let Err(e) = self.store.mark_read(&request.message_ids).await {
            error!("Failed to mark messages read in {}: {}", request.room_id, e);
            return AckResponse::failed(e.to_string());
        }
        self.broadcast_to_room(
            &request.room_id,
            ServerEvent::MessagesRead(MessagesRead {
                message_ids: request.message_ids,
            })
            .into_frame(),
        )
        .await;
        AckResponse::ok()
    }

    async fn handle_client_ack(&self, connection_id: &str, frame: &Frame) {
        let Some(ack_id) = frame.ack else {
            return;
        };
        let pending = self.pending_acks.write().await.remove(&ack_id);
        match pending {
            Some((member, message_id)) if member == connection_id => {
                let response = frame.ack_response();
                if response.success {
                    debug!("Message {} delivered to {}", message_id, connection_id);
                } else {
                    warn!(
                        "{} rejected message {}: {}",
                        connection_id,
                        message_id,
                        response.error.unwrap_or_default()
                    );
                }
            }
            _ => debug!("Unexpected ack {} from {}", ack_id, connection_id),
        }
    }

    async fn leave_room(&self, connection_id: &str, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_id) {
            if room.remove_member(connection_id) {
                info!("{} left room {}", connection_id, room_id);
            }
            if room.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    pub async fn handle_disconnect(&self, connection_id: &str) {
        {
            let mut rooms = self.rooms.write().await;
            for room in rooms.values_mut() {
                room.remove_member(connection_id);
            }
            rooms.retain(|_, room| !room.is_empty());
        }
        self.admins.write().await.remove_member(connection_id);
        self.pending_acks
            .write()
            .await
            .retain(|_, (member, _)| member != connection_id);
        self.connections.write().await.remove(connection_id);
        info!("Connection {} closed", connection_id);
    }

    /// Persists a domain event and pushes it to every admin dashboard connection.
    pub async fn notify_admins(
        &self,
        kind: NotificationKind,
        message: String,
        details: Map<String, Value>,
    ) -> Result<Notification> {
        let notification = self.store.create_notification(kind, message, details).await?;
        let frame = match kind {
            NotificationKind::Donation => {
                ServerEvent::NewDonationNotification(notification.clone())
            }
            NotificationKind::InNeed => ServerEvent::NewInNeedNotification(notification.clone()),
        }
        .into_frame();

        let admins: Vec<String> = self.admins.read().await.members().cloned().collect();
        info!(
            "Broadcasting `{}` to {} admin session(s)",
            frame.event,
            admins.len()
        );
        for admin in admins {
            self.send_to(&admin, frame.clone()).await;
        }
        Ok(notification)
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.members().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn admin_count(&self) -> usize {
        self.admins.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn broadcast_to_room(&self, room_id: &str, frame: Frame) {
        for member in self.room_members(room_id).await {
            self.send_to(&member, frame.clone()).await;
        }
    }

    async fn reply(&self, connection_id: &str, ack: Option<u64>, response: AckResponse) {
        if let Some(ack_id) = ack {
            self.send_to(connection_id, Frame::ack_reply(ack_id, &response))
                .await;
        }
    }

    async fn send_to(&self, connection_id: &str, frame: Frame) {
        let connections = self.connections.read().await;
        if let Some(sender) = connections.get(connection_id) {
            let _ = sender.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{JOIN_ROOM, MARK_AS_READ, RECEIVE_MESSAGE, SEND_MESSAGE};
    use crate::models::NewMessage;
    use serde_json::json;

    fn server() -> Server {
        Server::new(Arc::new(MemoryStore::new()))
    }

    fn ack_of(frame: &Frame) -> AckResponse {
        assert!(frame.is_ack_reply(), "expected ack, got `{}`", frame.event);
        frame.ack_response()
    }

    #[tokio::test]
    async fn join_room_is_idempotent_and_acked() {
        let server = server();
        let (id, mut rx) = server.register_connection().await;

        for ack in [1, 2] {
            server
                .handle_frame(&id, Frame::new(JOIN_ROOM, json!("alice-bob")).with_ack(ack))
                .await;
            let reply = rx.recv().await.unwrap();
            assert_eq!(reply.ack, Some(ack));
            assert!(ack_of(&reply).success);
        }
        assert_eq!(server.room_members("alice-bob").await, vec![id]);
    }

    #[tokio::test]
    async fn empty_room_id_is_rejected() {
        let server = server();
        let (id, mut rx) = server.register_connection().await;
        server
            .handle_frame(&id, Frame::new(JOIN_ROOM, json!("")).with_ack(1))
            .await;
        assert!(!ack_of(&rx.recv().await.unwrap()).success);
    }

    #[tokio::test]
    async fn send_requires_membership() {
        let server = server();
        let (id, mut rx) = server.register_connection().await;
        let message = NewMessage::new("hello", "alice-bob", "alice", "bob").into_message();
        server
            .handle_frame(
                &id,
                Frame::new(SEND_MESSAGE, serde_json::to_value(&message).unwrap()).with_ack(9),
            )
            .await;
        let reply = ack_of(&rx.recv().await.unwrap());
        assert_eq!(reply, AckResponse::failed("not joined to room alice-bob"));
    }

    #[tokio::test]
    async fn message_fans_out_to_whole_room_with_delivery_acks() {
        let server = server();
        let (alice, mut alice_rx) = server.register_connection().await;
        let (bob, mut bob_rx) = server.register_connection().await;
        for (id, rx) in [(&alice, &mut alice_rx), (&bob, &mut bob_rx)] {
            server
                .handle_frame(id, Frame::new(JOIN_ROOM, json!("alice-bob")).with_ack(1))
                .await;
            rx.recv().await.unwrap();
        }

        let message = NewMessage::new("hello", "alice-bob", "alice", "bob").into_message();
        server
            .handle_frame(
                &alice,
                Frame::new(SEND_MESSAGE, serde_json::to_value(&message).unwrap()).with_ack(2),
            )
            .await;

        assert!(ack_of(&alice_rx.recv().await.unwrap()).success);
        let echoed = alice_rx.recv().await.unwrap();
        let delivered = bob_rx.recv().await.unwrap();
        for frame in [&echoed, &delivered] {
            assert_eq!(frame.event, RECEIVE_MESSAGE);
            assert!(frame.ack.is_some());
            assert_eq!(frame.data["id"], json!(message.id));
        }

        let ack_id = delivered.ack.unwrap();
        server
            .handle_frame(&bob, Frame::ack_reply(ack_id, &AckResponse::ok()))
            .await;
        assert!(!server.pending_acks.read().await.contains_key(&ack_id));
    }

    #[tokio::test]
    async fn read_receipts_require_membership() {
        let server = server();
        let message = server
            .store()
            .create_message(NewMessage::new("private", "alice-bob", "alice", "bob"))
            .await
            .unwrap();
        let (alice, mut alice_rx) = server.register_connection().await;
        let (mallory, mut mallory_rx) = server.register_connection().await;
        server
            .handle_frame(&alice, Frame::new(JOIN_ROOM, json!("alice-bob")).with_ack(1))
            .await;
        alice_rx.recv().await.unwrap();

        server
            .handle_frame(
                &mallory,
                Frame::new(
                    MARK_AS_READ,
                    json!({ "roomId": "alice-bob", "messageIds": [message.id] }),
                )
                .with_ack(2),
            )
            .await;

        let reply = ack_of(&mallory_rx.recv().await.unwrap());
        assert_eq!(reply, AckResponse::failed("not joined to room alice-bob"));
        assert!(alice_rx.try_recv().is_err());
        let stored = server.store().list_messages("alice-bob").await.unwrap();
        assert!(!stored[0].is_read);
    }

    #[tokio::test]
    async fn disconnect_cleans_up_memberships() {
        let server = server();
        let (id, _rx) = server.register_connection().await;
        server
            .handle_frame(&id, Frame::new(JOIN_ROOM, json!("alice-bob")))
            .await;
        server
            .handle_frame(&id, Frame::new("join_admin_dashboard", Value::Null))
            .await;
        assert_eq!(server.admin_count().await, 1);

        server.handle_disconnect(&id).await;
        assert!(server.room_members("alice-bob").await.is_empty());
        assert_eq!(server.admin_count().await, 0);
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn every_admin_session_receives_each_notification_once() {
        let server = server();
        let (a, mut a_rx) = server.register_connection().await;
        let (b, mut b_rx) = server.register_connection().await;
        let (_c, mut c_rx) = server.register_connection().await;
        for id in [&a, &b] {
            server
                .handle_frame(id, Frame::new("join_admin_dashboard", Value::Null))
                .await;
        }

        let notification = server
            .notify_admins(
                NotificationKind::Donation,
                "New donation item: coats".to_string(),
                Map::new(),
            )
            .await
            .unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.event, "new_donation_notification");
            assert_eq!(frame.data["id"], json!(notification.id));
            assert!(rx.try_recv().is_err());
        }
        assert!(c_rx.try_recv().is_err());
    }
}
