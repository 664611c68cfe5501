pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod models;
pub mod room;
pub mod server;
pub mod store;

pub use error::{ChatError, Result};
