//! Market-data feed boundary.
//!
//! The core consumes normalized `FeedEvent`s and a couple of REST-shaped
//! fetches; raw exchange wire formats stay behind this trait. The Binance
//! implementation lives in `binance.rs`; tests script their own feeds.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::book::{DepthSnapshot, Kline, OiReading, TradePrint};

pub mod binance;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Depth(DepthSnapshot),
    Trade(TradePrint),
}

/// Handle for an active stream. Cancelling aborts the producer task; no
/// further events are delivered after `cancel` returns.
pub struct FeedSubscription {
    task: JoinHandle<()>,
}

impl FeedSubscription {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Start streaming depth snapshots and trade prints for one symbol into
    /// the given channel. Returns a handle that stops the stream.
    async fn subscribe(
        &self,
        symbol: &str,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<FeedSubscription>;

    /// Recent klines, oldest first.
    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;

    async fn fetch_open_interest(&self, symbol: &str) -> Result<OiReading>;
}
