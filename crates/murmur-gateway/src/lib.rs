//! Realtime side of Murmur: the connection hub, its dispatcher, and the
//! per-connection WebSocket loop.

pub mod connection;
pub mod error;
pub mod hub;

pub use error::HubError;
pub use hub::{ConnectionHub, Dispatcher, HubConfig};
