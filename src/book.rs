//! Normalized order-book and trade-flow types.
//!
//! Everything downstream of the feed adapter speaks these types; raw exchange
//! wire formats never cross this boundary.

use serde::{Deserialize, Serialize};

/// Resting side of the book an order sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }

}

/// One price level of a depth snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PriceLevel {
    pub price: f64,
    pub qty: f64,
}

/// A side-tagged level, the unit the tracker consumes.
#[derive(Debug, Clone, Copy)]
pub struct BookLevel {
    pub side: Side,
    pub price: f64,
    pub qty: f64,
}

/// Point-in-time view of the book. Bids sorted descending, asks ascending,
/// best level first on both sides.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub ts_ms: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl DepthSnapshot {
    /// Mid price from the best bid/ask. None when either side is empty or
    /// the top of book is degenerate.
    pub fn mid_price(&self) -> Option<f64> {
        let bid = self.bids.first()?.price;
        let ask = self.asks.first()?.price;
        let mid = (bid + ask) / 2.0;
        if mid.is_finite() && mid > 0.0 {
            Some(mid)
        } else {
            None
        }
    }

    /// Flatten both sides into side-tagged levels.
    pub fn levels(&self) -> Vec<BookLevel> {
        let mut out = Vec::with_capacity(self.bids.len() + self.asks.len());
        for l in &self.bids {
            out.push(BookLevel { side: Side::Bid, price: l.price, qty: l.qty });
        }
        for l in &self.asks {
            out.push(BookLevel { side: Side::Ask, price: l.price, qty: l.qty });
        }
        out
    }

    /// Total quote value resting in the top `n` levels of one side.
    pub fn top_value(&self, side: Side, n: usize) -> f64 {
        let levels = match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        };
        levels.iter().take(n).map(|l| l.price * l.qty).sum()
    }
}

/// A trade print, already resolved to the book side it consumed:
/// an aggressive sell eats bids, an aggressive buy eats asks.
#[derive(Debug, Clone, Copy)]
pub struct TradePrint {
    pub price: f64,
    pub qty: f64,
    pub consumed_side: Side,
    pub ts_ms: u64,
}

/// Minimal kline used for the CVD approximation.
#[derive(Debug, Clone, Copy)]
pub struct Kline {
    pub open_ms: u64,
    pub open: f64,
    pub close: f64,
    pub volume: f64,
}

impl Kline {
    /// Signed volume delta under the close-vs-open approximation.
    pub fn signed_delta(&self) -> f64 {
        if self.close > self.open {
            self.volume
        } else {
            -self.volume
        }
    }
}

/// One open-interest reading.
#[derive(Debug, Clone, Copy)]
pub struct OiReading {
    pub value: f64,
    pub ts_ms: u64,
}
