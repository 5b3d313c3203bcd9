//! WebSocket transport
//!
//! Reconnecting client shared by the live quote feed and the remote venue,
//! plus the backoff schedule both use.

mod backoff;
mod client;
mod types;

pub use backoff::Backoff;
pub use client::WsClient;
pub use types::{WsConfig, WsError, WsMessage};
