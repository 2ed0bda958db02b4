//! Binance futures feed adapter.
//!
//! Depth is maintained locally from the `@depth@100ms` diff stream, seeded
//! with a REST snapshot, and emitted as a full `DepthSnapshot` on every
//! update. `@aggTrade` prints are forwarded for consumption reconciliation.
//! Klines and open interest come from the REST API on demand.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use url::Url;

use crate::book::{DepthSnapshot, Kline, OiReading, PriceLevel, Side, TradePrint};
use crate::config::Config;
use crate::feed::{FeedEvent, FeedSubscription, MarketFeed};
use crate::logging::{json_log, json_log_at, obj, v_num, v_str, Domain, Level};

/// Reconnect backoff: base delay, growth factor, attempt cap.
const RECONNECT_BASE_MS: u64 = 5_000;
const RECONNECT_FACTOR: f64 = 1.5;
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Book levels kept per side in the local mirror.
const BOOK_DEPTH_CAP: usize = 1_000;

/// Price resolution for the local book's integer keys.
const PRICE_TICK: f64 = 1e-8;

pub struct BinanceFeed {
    client: Client,
    ws_base: String,
    rest_base: String,
}

impl BinanceFeed {
    pub fn new(cfg: &Config) -> Self {
        Self {
            client: Client::new(),
            ws_base: cfg.ws_base.clone(),
            rest_base: cfg.fapi_base.clone(),
        }
    }

    fn stream_url(&self, symbol: &str) -> Result<Url> {
        let sym = symbol.to_lowercase();
        let raw = format!(
            "{}/stream?streams={}@depth@100ms/{}@aggTrade",
            self.ws_base, sym, sym
        );
        Ok(Url::parse(&raw)?)
    }

    async fn fetch_depth_snapshot(&self, symbol: &str) -> Result<RestDepth> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit=1000",
            self.rest_base, symbol
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("depth snapshot error: {}", resp.status()));
        }
        Ok(resp.json().await?)
    }
}

// Binance wire types

#[derive(Debug, Deserialize)]
struct RestDepth {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DepthDiff {
    #[serde(rename = "E")]
    event_ms: u64,
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
    #[serde(rename = "T")]
    trade_ms: u64,
}

/// Local book mirror keyed at fixed price resolution.
struct LocalBook {
    bids: BTreeMap<i64, f64>,
    asks: BTreeMap<i64, f64>,
}

impl LocalBook {
    fn new() -> Self {
        Self { bids: BTreeMap::new(), asks: BTreeMap::new() }
    }

    fn seed(&mut self, depth: &RestDepth) {
        self.bids.clear();
        self.asks.clear();
        for (p, q) in &depth.bids {
            Self::apply_level(&mut self.bids, p, q);
        }
        for (p, q) in &depth.asks {
            Self::apply_level(&mut self.asks, p, q);
        }
    }

    fn apply_diff(&mut self, diff: &DepthDiff) {
        for (p, q) in &diff.bids {
            Self::apply_level(&mut self.bids, p, q);
        }
        for (p, q) in &diff.asks {
            Self::apply_level(&mut self.asks, p, q);
        }
    }

    fn apply_level(side: &mut BTreeMap<i64, f64>, price: &str, qty: &str) {
        let (Ok(price), Ok(qty)) = (price.parse::<f64>(), qty.parse::<f64>()) else {
            return;
        };
        let key = (price / PRICE_TICK).round() as i64;
        if qty == 0.0 {
            side.remove(&key);
        } else {
            side.insert(key, qty);
        }
    }

    fn snapshot(&self, symbol: &str, ts_ms: u64) -> DepthSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(BOOK_DEPTH_CAP)
            .map(|(k, q)| PriceLevel { price: *k as f64 * PRICE_TICK, qty: *q })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(BOOK_DEPTH_CAP)
            .map(|(k, q)| PriceLevel { price: *k as f64 * PRICE_TICK, qty: *q })
            .collect();
        DepthSnapshot { symbol: symbol.to_string(), ts_ms, bids, asks }
    }
}

#[async_trait]
impl MarketFeed for BinanceFeed {
    async fn subscribe(
        &self,
        symbol: &str,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<FeedSubscription> {
        let url = self.stream_url(symbol)?;
        let symbol = symbol.to_string();
        let feed = BinanceFeed {
            client: self.client.clone(),
            ws_base: self.ws_base.clone(),
            rest_base: self.rest_base.clone(),
        };

        let task = tokio::spawn(async move {
            let mut attempts: u32 = 0;
            loop {
                match run_stream(&feed, &url, &symbol, &events).await {
                    Ok(()) => return, // receiver dropped, clean shutdown
                    Err(err) => {
                        json_log_at(
                            Level::Warn,
                            Domain::Feed,
                            "stream_disconnected",
                            obj(&[
                                ("symbol", v_str(&symbol)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
                attempts += 1;
                if attempts > RECONNECT_MAX_ATTEMPTS {
                    json_log_at(
                        Level::Error,
                        Domain::Feed,
                        "stream_gave_up",
                        obj(&[
                            ("symbol", v_str(&symbol)),
                            ("attempts", v_num(attempts as f64)),
                        ]),
                    );
                    return;
                }
                let base = RECONNECT_BASE_MS as f64 * RECONNECT_FACTOR.powi(attempts as i32 - 1);
                let jitter: f64 = rand::thread_rng().gen_range(0.0..base * 0.3);
                let delay = Duration::from_millis((base + jitter) as u64);
                json_log(
                    Domain::Feed,
                    "stream_reconnecting",
                    obj(&[
                        ("symbol", v_str(&symbol)),
                        ("attempt", v_num(attempts as f64)),
                        ("delay_ms", v_num(delay.as_millis() as f64)),
                    ]),
                );
                sleep(delay).await;
            }
        });

        Ok(FeedSubscription::new(task))
    }

    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.rest_base, symbol, interval, limit
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("klines error: {}", resp.status()));
        }
        let data: Vec<Vec<serde_json::Value>> = resp.json().await?;
        let mut out = Vec::with_capacity(data.len());
        for row in &data {
            if row.len() < 6 {
                continue;
            }
            out.push(Kline {
                open_ms: row[0].as_u64().unwrap_or(0),
                open: row[1].as_str().unwrap_or("0").parse().unwrap_or(0.0),
                close: row[4].as_str().unwrap_or("0").parse().unwrap_or(0.0),
                volume: row[5].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            });
        }
        Ok(out)
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<OiReading> {
        #[derive(Deserialize)]
        struct OiResp {
            #[serde(rename = "openInterest")]
            open_interest: String,
            time: u64,
        }
        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.rest_base, symbol);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("openInterest error: {}", resp.status()));
        }
        let data: OiResp = resp.json().await?;
        let value = data
            .open_interest
            .parse::<f64>()
            .map_err(|e| anyhow!("bad openInterest value: {}", e))?;
        Ok(OiReading { value, ts_ms: data.time })
    }
}

/// One websocket session: seed the local book, then stream until the socket
/// drops or the receiver goes away. `Ok(())` means the consumer is gone.
async fn run_stream(
    feed: &BinanceFeed,
    url: &Url,
    symbol: &str,
    events: &mpsc::Sender<FeedEvent>,
) -> Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (_write, mut read) = ws.split();

    let mut book = LocalBook::new();
    let seed = feed.fetch_depth_snapshot(symbol).await?;
    book.seed(&seed);
    json_log(
        Domain::Feed,
        "stream_connected",
        obj(&[
            ("symbol", v_str(symbol)),
            ("seed_bids", v_num(seed.bids.len() as f64)),
            ("seed_asks", v_num(seed.asks.len() as f64)),
        ]),
    );

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Ok(text) = msg.into_text() else {
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<StreamEnvelope>(&text) else {
            continue;
        };

        if envelope.stream.ends_with("@aggTrade") {
            if let Ok(trade) = serde_json::from_value::<AggTrade>(envelope.data) {
                let (Ok(price), Ok(qty)) =
                    (trade.price.parse::<f64>(), trade.qty.parse::<f64>())
                else {
                    continue;
                };
                // Buyer as maker means the aggressor sold into resting bids
                let consumed_side = if trade.buyer_is_maker { Side::Bid } else { Side::Ask };
                let event = FeedEvent::Trade(TradePrint {
                    price,
                    qty,
                    consumed_side,
                    ts_ms: trade.trade_ms,
                });
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        } else if envelope.stream.contains("@depth") {
            if let Ok(diff) = serde_json::from_value::<DepthDiff>(envelope.data) {
                book.apply_diff(&diff);
                let event = FeedEvent::Depth(book.snapshot(symbol, diff.event_ms));
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    Err(anyhow!("websocket closed"))
}
