//! Courier delivery server library.
//!
//! Routes direct messages between identities: live over a WebSocket when
//! the receiver is connected, otherwise into a durable per-receiver pending
//! queue that is flushed when the receiver reconnects. Exposed as a library
//! for embedding and in-process tests.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod ledger;
pub mod locks;
pub mod presence;
pub mod rooms;
pub mod router;
pub mod server;
pub mod store;
pub mod ws;
