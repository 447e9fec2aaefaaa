//! Types shared between the Murmur HTTP API, the realtime gateway and the
//! storage layer.

pub mod api;
pub mod events;
pub mod models;
