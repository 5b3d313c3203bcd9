//! In-process quote feed

use super::QuoteFeed;
use crate::data::Quote;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Feed backed by a channel the caller pushes quotes into.
///
/// Used for replaying recorded quotes and for tests. Can be subscribed once.
pub struct ChannelFeed {
    rx: Mutex<Option<mpsc::Receiver<Quote>>>,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Quote>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl QuoteFeed for ChannelFeed {
    async fn subscribe(&self) -> Result<mpsc::Receiver<Quote>> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| EngineError::InvalidConfig("channel feed already subscribed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_channel_feed_delivers_once() {
        let (feed, tx) = ChannelFeed::new(4);
        let mut rx = feed.subscribe().await.unwrap();

        tx.send(Quote {
            symbol: "X".into(),
            price: dec!(10),
            volume: dec!(0),
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(9, 31, 0)
                .unwrap(),
        })
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap().price, dec!(10));
        assert!(feed.subscribe().await.is_err());
    }
}
