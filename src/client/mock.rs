//! In-process `Transport` for exercising the session and feed state machines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::transport::{AckReceiver, Acker, ConnectionState, Handler, HandlerId, Transport};
use crate::error::{ChatError, Result};
use crate::messages::Frame;
use crate::models::AckResponse;

pub(crate) struct MockTransport {
    handlers: Mutex<HashMap<String, (HandlerId, Handler)>>,
    emitted: Mutex<Vec<Frame>>,
    replies: Mutex<HashMap<String, AckResponse>>,
    acks_tx: mpsc::UnboundedSender<Frame>,
    acks_rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    next_ack: AtomicU64,
    offline: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        Arc::new(MockTransport {
            handlers: Mutex::new(HashMap::new()),
            emitted: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            acks_tx,
            acks_rx: Mutex::new(acks_rx),
            next_ack: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Answer every future `event` with `response` instead of success.
    pub(crate) fn reply_to(&self, event: &str, response: AckResponse) {
        self.replies
            .lock()
            .unwrap()
            .insert(event.to_string(), response);
    }

    pub(crate) fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    /// Plays a server frame into the registered handler.
    pub(crate) fn deliver(&self, event: &str, data: Value, want_ack: bool) -> bool {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(event)
            .map(|(_, h)| Arc::clone(h));
        let Some(handler) = handler else {
            return false;
        };
        let acker = want_ack.then(|| {
            Acker::new(self.next_ack.fetch_add(1, Ordering::Relaxed), self.acks_tx.clone())
        });
        handler(data, acker);
        true
    }

    /// Acks the client sent back for delivered frames.
    pub(crate) fn client_acks(&self) -> Vec<AckResponse> {
        let mut rx = self.acks_rx.lock().unwrap();
        let mut acks = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            acks.push(frame.ack_response());
        }
        acks
    }

    pub(crate) fn emitted(&self, event: &str) -> Vec<Value> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.event == event)
            .map(|f| f.data.clone())
            .collect()
    }

    pub(crate) fn has_handler(&self, event: &str) -> bool {
        self.handlers.lock().unwrap().contains_key(event)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, frame: Frame) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChatError::Connection("offline".to_string()));
        }
        self.emitted.lock().unwrap().push(frame);
        Ok(())
    }
}

impl Transport for MockTransport {
    fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.record(Frame::new(event, data))
    }

    fn emit_with_ack(&self, event: &str, data: Value) -> Result<AckReceiver> {
        self.record(Frame::new(event, data))?;
        let response = self
            .replies
            .lock()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or_else(AckResponse::ok);
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(response);
        Ok(rx)
    }

    fn on(&self, event: &str, handler: Handler) -> Result<HandlerId> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(event) {
            return Err(ChatError::HandlerRegistered(event.to_string()));
        }
        let id = HandlerId::next();
        handlers.insert(event.to_string(), (id, handler));
        Ok(id)
    }

    fn off(&self, event: &str) -> bool {
        self.handlers.lock().unwrap().remove(event).is_some()
    }

    fn off_if(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.get(event).is_some_and(|(owner, _)| *owner == id) {
            handlers.remove(event);
            true
        } else {
            false
        }
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else if self.offline.load(Ordering::SeqCst) {
            ConnectionState::Offline
        } else {
            ConnectionState::Connected
        }
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handlers_need_explicit_removal_before_replacement() {
        let transport = MockTransport::new();
        let noop: Handler = Arc::new(|_: Value, _: Option<Acker>| {});
        let first = transport.on("receive_message", noop.clone()).unwrap();
        assert_eq!(
            transport.on("receive_message", noop.clone()).unwrap_err(),
            ChatError::HandlerRegistered("receive_message".to_string())
        );
        assert!(transport.off("receive_message"));
        let second = transport.on("receive_message", noop).unwrap();
        assert_ne!(first, second);
        assert!(transport.deliver("receive_message", json!({}), false));
    }

    #[test]
    fn off_if_leaves_newer_registration_alone() {
        let transport = MockTransport::new();
        let noop: Handler = Arc::new(|_: Value, _: Option<Acker>| {});
        let stale = transport.on("messages_read", noop.clone()).unwrap();
        transport.off("messages_read");
        let current = transport.on("messages_read", noop).unwrap();

        assert!(!transport.off_if("messages_read", stale));
        assert!(transport.has_handler("messages_read"));
        assert!(transport.off_if("messages_read", current));
        assert!(!transport.has_handler("messages_read"));
    }
}
