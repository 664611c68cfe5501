use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ChatError, Result};
use crate::messages::{Frame, JOIN_ROOM, LEAVE_ROOM};
use crate::models::AckResponse;

/// Emitted locally after the connection drops.
pub const DISCONNECT: &str = "disconnect";
/// Emitted locally after an automatic reconnection succeeds.
pub const RECONNECT: &str = "reconnect";
/// Emitted locally once every reconnection attempt has failed.
pub const RECONNECT_FAILED: &str = "reconnect_failed";

pub type Handler = Arc<dyn Fn(Value, Option<Acker>) + Send + Sync>;
pub type AckReceiver = oneshot::Receiver<AckResponse>;

/// Names one `on` registration, so its owner can remove it without touching a
/// handler registered later for the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandlerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Answers an incoming frame that asked for an acknowledgment.
#[derive(Debug, Clone)]
pub struct Acker {
    ack_id: u64,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Acker {
    pub(crate) fn new(ack_id: u64, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Acker { ack_id, outbound }
    }

    pub fn send(self, response: AckResponse) {
        if self
            .outbound
            .send(Frame::ack_reply(self.ack_id, &response))
            .is_err()
        {
            debug!("Dropped ack {}: connection gone", self.ack_id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted. Only a new `connect` brings the client back.
    Offline,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Persistent WebSocket stream. Long polling is not offered.
    #[default]
    WebSocket,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub transport: TransportKind,
    pub reconnection_attempts: u32,
    /// Per connection attempt, also used as the acknowledgment deadline.
    pub timeout: Duration,
    pub reconnection_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            transport: TransportKind::WebSocket,
            reconnection_attempts: 5,
            timeout: Duration::from_millis(10_000),
            reconnection_delay: Duration::from_secs(1),
        }
    }
}

impl ConnectOptions {
    /// Linear backoff with up to half a step of jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.reconnection_delay * attempt;
        let jitter_ms = u64::try_from(self.reconnection_delay.as_millis() / 2).unwrap_or(0);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Event channel to the relay. Handlers are keyed by event name and must be
/// removed with `off` before a new one can take their place.
pub trait Transport: Send + Sync {
    fn emit(&self, event: &str, data: Value) -> Result<()>;

    /// Queues the frame and returns immediately. The receiver resolves with the
    /// peer's answer, or errors if the connection drops first.
    fn emit_with_ack(&self, event: &str, data: Value) -> Result<AckReceiver>;

    fn on(&self, event: &str, handler: Handler) -> Result<HandlerId>;

    /// Removes whatever handler is registered. Returns whether one was.
    fn off(&self, event: &str) -> bool;

    /// Removes the handler only while it is still registration `id`.
    fn off_if(&self, event: &str, id: HandlerId) -> bool;

    fn state(&self) -> ConnectionState;

    fn ack_timeout(&self) -> Duration;

    fn close(&self);

    fn join(&self, room_id: &str) -> Result<AckReceiver> {
        self.emit_with_ack(JOIN_ROOM, json!(room_id))
    }

    fn leave(&self, room_id: &str) -> Result<()> {
        self.emit(LEAVE_ROOM, json!(room_id))
    }
}

/// Waits for an acknowledgment without holding up anything but the caller.
pub async fn wait_for_ack(receiver: AckReceiver, timeout: Duration, event: &str) -> Result<()> {
    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(response)) => response.into_result(event),
        Ok(Err(_)) => Err(ChatError::Connection(format!(
            "connection lost before `{event}` was acknowledged"
        ))),
        Err(_) => Err(ChatError::ack_failure(
            event,
            "timed out waiting for acknowledgment",
        )),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    endpoint: String,
    options: ConnectOptions,
    outbound: mpsc::UnboundedSender<Frame>,
    handlers: Mutex<HashMap<String, (HandlerId, Handler)>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<AckResponse>>>,
    next_ack: AtomicU64,
    state: watch::Sender<ConnectionState>,
    shutdown: Notify,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        match *self.state.borrow() {
            ConnectionState::Offline | ConnectionState::Closed => {
                return Err(ChatError::Connection(format!(
                    "cannot emit `{}`: connection is offline",
                    frame.event
                )));
            }
            ConnectionState::Connected | ConnectionState::Reconnecting { .. } => {}
        }
        self.outbound
            .send(frame)
            .map_err(|_| ChatError::Connection("connection driver stopped".to_string()))
    }

    fn handle_incoming(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed frame from {}: {}", self.endpoint, e);
                return;
            }
        };

        if frame.is_ack_reply() {
            let waiter = frame.ack.and_then(|id| lock(&self.pending).remove(&id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(frame.ack_response());
                }
                None => debug!("Ack {:?} has no waiter", frame.ack),
            }
            return;
        }

        let acker = frame
            .ack
            .map(|id| Acker::new(id, self.outbound.clone()));
        self.dispatch(&frame.event, frame.data, acker);
    }

    fn dispatch(&self, event: &str, data: Value, acker: Option<Acker>) {
        let handler = lock(&self.handlers).get(event).map(|(_, h)| Arc::clone(h));
        match handler {
            Some(handler) => handler(data, acker),
            None => {
                debug!("No handler for `{}`", event);
                if let Some(acker) = acker {
                    acker.send(AckResponse::failed("no handler"));
                }
            }
        }
    }

    /// Pending acks can no longer be answered by the new socket.
    fn drop_pending(&self) {
        let dropped = lock(&self.pending).drain().count();
        if dropped > 0 {
            debug!("Dropped {} pending ack(s)", dropped);
        }
    }
}

enum SocketEnd {
    Closed,
    Lost,
}

enum Reconnect {
    Connected(WsStream, u32),
    Exhausted,
    Closed,
}

/// WebSocket connection owned by whoever opened it and shared by reference.
pub struct WsConnection {
    inner: Arc<Inner>,
}

impl WsConnection {
    pub async fn connect(endpoint: &str, options: ConnectOptions) -> Result<Self> {
        let socket = match open_socket(endpoint, options.timeout).await {
            Ok(socket) => socket,
            Err(first) => {
                warn!("Connecting to {} failed: {}", endpoint, first);
                let mut last = first;
                let mut connected = None;
                for attempt in 1..=options.reconnection_attempts {
                    tokio::time::sleep(options.backoff(attempt)).await;
                    match open_socket(endpoint, options.timeout).await {
                        Ok(socket) => {
                            connected = Some(socket);
                            break;
                        }
                        Err(e) => {
                            warn!("Connect attempt {} to {} failed: {}", attempt, endpoint, e);
                            last = e;
                        }
                    }
                }
                connected.ok_or(last)?
            }
        };
        info!("Connected to {}", endpoint);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let inner = Arc::new(Inner {
            endpoint: endpoint.to_string(),
            options,
            outbound,
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            state,
            shutdown: Notify::new(),
        });

        tokio::spawn(drive(Arc::clone(&inner), socket, outbound_rx));
        Ok(WsConnection { inner })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

impl Transport for WsConnection {
    fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.inner.send_frame(Frame::new(event, data))
    }

    fn emit_with_ack(&self, event: &str, data: Value) -> Result<AckReceiver> {
        let ack_id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(ack_id, tx);
        if let Err(e) = self
            .inner
            .send_frame(Frame::new(event, data).with_ack(ack_id))
        {
            lock(&self.inner.pending).remove(&ack_id);
            return Err(e);
        }
        Ok(rx)
    }

    fn on(&self, event: &str, handler: Handler) -> Result<HandlerId> {
        let mut handlers = lock(&self.inner.handlers);
        if handlers.contains_key(event) {
            return Err(ChatError::HandlerRegistered(event.to_string()));
        }
        let id = HandlerId::next();
        handlers.insert(event.to_string(), (id, handler));
        Ok(id)
    }

    fn off(&self, event: &str) -> bool {
        lock(&self.inner.handlers).remove(event).is_some()
    }

    fn off_if(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        if handlers.get(event).is_some_and(|(owner, _)| *owner == id) {
            handlers.remove(event);
            true
        } else {
            false
        }
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn ack_timeout(&self) -> Duration {
        self.inner.options.timeout
    }

    fn close(&self) {
        match self.state() {
            ConnectionState::Closed => {}
            // The driver has already exited.
            ConnectionState::Offline => self.inner.set_state(ConnectionState::Closed),
            ConnectionState::Connected | ConnectionState::Reconnecting { .. } => {
                self.inner.shutdown.notify_one();
            }
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn open_socket(endpoint: &str, timeout: Duration) -> Result<WsStream> {
    match tokio::time::timeout(timeout, connect_async(endpoint)).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ChatError::Connection(format!(
            "timed out connecting to {endpoint}"
        ))),
    }
}

async fn drive(
    inner: Arc<Inner>,
    mut socket: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        match pump(&inner, socket, &mut outbound).await {
            SocketEnd::Closed => break,
            SocketEnd::Lost => {}
        }

        warn!("Lost connection to {}", inner.endpoint);
        inner.drop_pending();
        inner.dispatch(DISCONNECT, Value::Null, None);

        match reconnect(&inner).await {
            Reconnect::Connected(new_socket, attempt) => {
                info!("Reconnected to {} after {} attempt(s)", inner.endpoint, attempt);
                socket = new_socket;
                inner.set_state(ConnectionState::Connected);
                inner.dispatch(RECONNECT, json!({ "attempts": attempt }), None);
            }
            Reconnect::Exhausted => {
                error!(
                    "Giving up on {} after {} attempt(s)",
                    inner.endpoint, inner.options.reconnection_attempts
                );
                inner.set_state(ConnectionState::Offline);
                inner.drop_pending();
                inner.dispatch(RECONNECT_FAILED, Value::Null, None);
                return;
            }
            Reconnect::Closed => break,
        }
    }

    inner.set_state(ConnectionState::Closed);
    inner.drop_pending();
    info!("Connection to {} closed", inner.endpoint);
}

async fn pump(
    inner: &Inner,
    socket: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
) -> SocketEnd {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            () = inner.shutdown.notified() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return SocketEnd::Closed;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SocketEnd::Closed;
                };
                match frame.to_text() {
                    Ok(text) => {
                        if let Err(e) = sink.send(WsMessage::text(text)).await {
                            warn!("Failed to send `{}`: {}", frame.event, e);
                            return SocketEnd::Lost;
                        }
                    }
                    Err(e) => error!("Failed to encode `{}`: {}", frame.event, e),
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => inner.handle_incoming(text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => return SocketEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error from {}: {}", inner.endpoint, e);
                    return SocketEnd::Lost;
                }
            },
        }
    }
}

async fn reconnect(inner: &Inner) -> Reconnect {
    for attempt in 1..=inner.options.reconnection_attempts {
        inner.set_state(ConnectionState::Reconnecting { attempt });
        tokio::select! {
            () = inner.shutdown.notified() => return Reconnect::Closed,
            () = tokio::time::sleep(inner.options.backoff(attempt)) => {}
        }
        match open_socket(&inner.endpoint, inner.options.timeout).await {
            Ok(socket) => return Reconnect::Connected(socket, attempt),
            Err(e) => warn!("Reconnect attempt {} to {} failed: {}", attempt, inner.endpoint, e),
        }
    }
    Reconnect::Exhausted
}
