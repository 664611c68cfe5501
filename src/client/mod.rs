//! Client side of the relay: the socket connection, chat sessions, the admin
//! notification feed, and the REST-backed store.

pub mod admin;
#[cfg(test)]
mod mock;
pub mod rest;
pub mod session;
pub mod transport;

pub use admin::{AdminFeed, FeedUpdate, NotificationCache, Toast};
pub use rest::RestStore;
pub use session::{ChatSession, DeliveryStatus, SessionPhase, SessionUpdate};
pub use transport::{ConnectOptions, ConnectionState, Transport, WsConnection};
