//! Live quote feeds
//!
//! Quotes drive the live scheduler: each one marks the ledger, feeds the
//! bar aggregator and may trigger venue-side fills.

mod channel;
mod stream;

pub use channel::ChannelFeed;
pub use stream::WsQuoteFeed;

use crate::data::Quote;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Trait for live quote sources
#[async_trait]
pub trait QuoteFeed: Send + Sync {
    /// Start streaming. The receiver closes when the feed gives up.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Quote>>;
}
