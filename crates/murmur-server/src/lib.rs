//! Startup wiring for the Murmur binary: environment configuration and the
//! realtime listener's routes.

pub mod config;
pub mod socket;
