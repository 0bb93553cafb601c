pub mod apdu;
pub mod channel;
pub mod config;
pub mod connection;
pub mod service;
pub mod tag;
pub mod telemetry;
