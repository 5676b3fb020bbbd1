//! Courier client library: optimistic sends, acknowledgment reconciliation,
//! and the real-time and HTTP transports to the delivery server.

pub mod ack;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fallback;
pub mod state;
