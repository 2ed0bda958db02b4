//! Orchestration: one monitoring task per instrument.
//!
//! Each instrument's tracker and flow state are owned by a single task that
//! consumes a queue of feed events and timer ticks, so snapshots apply in
//! arrival order and `detect` always reads a consistent view. Nothing on the
//! depth path touches the network; CVD/OI refresh and persistence run from
//! timer events inside the same task and may await I/O while further feed
//! events buffer in the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};

use crate::aggregator::SignalAggregator;
use crate::book::{DepthSnapshot, TradePrint};
use crate::classifier::OrderClassifier;
use crate::config::Config;
use crate::feed::{FeedEvent, FeedSubscription, MarketFeed};
use crate::flow::FlowState;
use crate::logging::{json_log, json_log_at, now_ms, obj, v_num, v_str, Domain, Level};
use crate::record::DetectionRecord;
use crate::storage::DetectionStore;
use crate::tracker::{OrderTracker, TrackerStats};
use crate::trap::{TrapDetector, TrapInputs};

/// Queue depth for one instrument's event channel.
const EVENT_QUEUE_CAP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Unmonitored,
    Monitoring,
    Stopped,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Unmonitored => "unmonitored",
            MonitorState::Monitoring => "monitoring",
            MonitorState::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of one instrument's monitoring state.
#[derive(Debug, Clone)]
pub struct InstrumentStatus {
    pub symbol: String,
    pub cvd_cumulative: f64,
    pub open_interest: Option<f64>,
    pub tracker: TrackerStats,
    pub last_detect_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MonitoringStatus {
    pub state: MonitorState,
    pub detail: Option<InstrumentStatus>,
}

enum InstrumentEvent {
    Feed(FeedEvent),
    FlowTick,
    DetectTick,
    DetectRequest(oneshot::Sender<Result<DetectionRecord>>),
    StatusRequest(oneshot::Sender<InstrumentStatus>),
    Stop,
}

struct InstrumentRuntime {
    events: mpsc::Sender<InstrumentEvent>,
    worker: JoinHandle<()>,
    subscription: FeedSubscription,
    forwarder: JoinHandle<()>,
    flow_timer: JoinHandle<()>,
    detect_timer: JoinHandle<()>,
}

struct InstrumentSlot {
    state: MonitorState,
    runtime: Option<InstrumentRuntime>,
}

pub struct LargeOrderDetector {
    cfg: Config,
    feed: Arc<dyn MarketFeed>,
    store: Arc<Mutex<DetectionStore>>,
    instruments: HashMap<String, InstrumentSlot>,
}

impl LargeOrderDetector {
    pub fn new(cfg: Config, feed: Arc<dyn MarketFeed>, store: Arc<Mutex<DetectionStore>>) -> Self {
        Self { cfg, feed, store, instruments: HashMap::new() }
    }

    /// Load config overrides from the key/value store (defaults survive any
    /// failure), then start monitoring every requested instrument. A symbol
    /// that fails to start never blocks the others.
    pub async fn start(&mut self, symbols: &[String]) {
        let overrides = match self.store.lock() {
            Ok(store) => store.load_config_overrides(),
            Err(_) => Err(anyhow!("config store lock poisoned")),
        };
        match overrides {
            Ok(rows) => {
                if !rows.is_empty() {
                    self.cfg.apply_overrides(&rows);
                    json_log(
                        Domain::System,
                        "config_overrides_applied",
                        obj(&[("count", v_num(rows.len() as f64))]),
                    );
                }
            }
            Err(err) => {
                json_log_at(
                    Level::Warn,
                    Domain::System,
                    "config_load_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
        }

        for symbol in symbols {
            if let Err(err) = self.start_monitoring(symbol).await {
                json_log_at(
                    Level::Error,
                    Domain::System,
                    "monitor_start_failed",
                    obj(&[("symbol", v_str(symbol)), ("error", v_str(&err.to_string()))]),
                );
            }
        }
    }

    /// Idempotent: a symbol already in `Monitoring` is left untouched.
    pub async fn start_monitoring(&mut self, symbol: &str) -> Result<()> {
        if let Some(slot) = self.instruments.get(symbol) {
            if slot.state == MonitorState::Monitoring {
                json_log_at(
                    Level::Warn,
                    Domain::System,
                    "monitor_already_running",
                    obj(&[("symbol", v_str(symbol))]),
                );
                return Ok(());
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAP);

        // First flow refresh and detect cycle run near-immediately; the
        // tickers take over one period later
        let _ = events_tx.send(InstrumentEvent::FlowTick).await;
        let _ = events_tx.send(InstrumentEvent::DetectTick).await;

        // Feed events flow through a bridge so the feed only sees its own
        // channel type
        let (feed_tx, mut feed_rx) = mpsc::channel::<FeedEvent>(EVENT_QUEUE_CAP);
        let subscription = self.feed.subscribe(symbol, feed_tx).await?;
        let forwarder = tokio::spawn({
            let tx = events_tx.clone();
            async move {
                while let Some(event) = feed_rx.recv().await {
                    if tx.send(InstrumentEvent::Feed(event)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let flow_timer = spawn_ticker(
            events_tx.clone(),
            Duration::from_secs(self.cfg.flow_refresh_secs),
            || InstrumentEvent::FlowTick,
        );
        let detect_timer = spawn_ticker(
            events_tx.clone(),
            Duration::from_secs(self.cfg.detect_interval_secs),
            || InstrumentEvent::DetectTick,
        );

        let worker = InstrumentWorker::new(
            symbol,
            self.cfg.clone(),
            Arc::clone(&self.feed),
            Arc::clone(&self.store),
        );
        let worker = tokio::spawn(worker.run(events_rx));

        self.instruments.insert(
            symbol.to_string(),
            InstrumentSlot {
                state: MonitorState::Monitoring,
                runtime: Some(InstrumentRuntime {
                    events: events_tx,
                    worker,
                    subscription,
                    forwarder,
                    flow_timer,
                    detect_timer,
                }),
            },
        );
        json_log(Domain::System, "monitor_started", obj(&[("symbol", v_str(symbol))]));
        Ok(())
    }

    /// Stop one instrument, or all of them. Safe when not monitoring. After
    /// return the worker has drained and no further mutation occurs.
    pub async fn stop_monitoring(&mut self, symbol: Option<&str>) {
        let targets: Vec<String> = match symbol {
            Some(s) => vec![s.to_string()],
            None => self.instruments.keys().cloned().collect(),
        };
        for sym in targets {
            let Some(slot) = self.instruments.get_mut(&sym) else {
                continue;
            };
            let Some(runtime) = slot.runtime.take() else {
                slot.state = MonitorState::Stopped;
                continue;
            };
            // Silence every producer first, then let the worker drain
            runtime.subscription.cancel();
            runtime.forwarder.abort();
            runtime.flow_timer.abort();
            runtime.detect_timer.abort();
            let _ = runtime.events.send(InstrumentEvent::Stop).await;
            let _ = runtime.worker.await;
            slot.state = MonitorState::Stopped;
            json_log(Domain::System, "monitor_stopped", obj(&[("symbol", v_str(&sym))]));
        }
    }

    /// On-demand detection cycle for one instrument.
    pub async fn detect(&self, symbol: &str) -> Result<DetectionRecord> {
        let runtime = self
            .instruments
            .get(symbol)
            .and_then(|slot| slot.runtime.as_ref())
            .ok_or_else(|| anyhow!("{} is not monitored", symbol))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        runtime
            .events
            .send(InstrumentEvent::DetectRequest(reply_tx))
            .await
            .map_err(|_| anyhow!("{} monitor is shutting down", symbol))?;
        reply_rx.await.map_err(|_| anyhow!("{} monitor dropped the request", symbol))?
    }

    /// Lifecycle state plus live detail for every known instrument.
    pub async fn monitoring_status(&self) -> HashMap<String, MonitoringStatus> {
        let mut out = HashMap::new();
        for (symbol, slot) in &self.instruments {
            let detail = match &slot.runtime {
                Some(runtime) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let sent = runtime
                        .events
                        .send(InstrumentEvent::StatusRequest(reply_tx))
                        .await
                        .is_ok();
                    if sent {
                        reply_rx.await.ok()
                    } else {
                        None
                    }
                }
                None => None,
            };
            out.insert(symbol.clone(), MonitoringStatus { state: slot.state, detail });
        }
        out
    }

    /// Lifecycle state for one symbol. Symbols never started report
    /// `Unmonitored`.
    pub fn state(&self, symbol: &str) -> MonitorState {
        self.instruments
            .get(symbol)
            .map(|slot| slot.state)
            .unwrap_or(MonitorState::Unmonitored)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }
}

fn spawn_ticker<F>(
    tx: mpsc::Sender<InstrumentEvent>,
    period: Duration,
    make: F,
) -> JoinHandle<()>
where
    F: Fn() -> InstrumentEvent + Send + 'static,
{
    tokio::spawn(async move {
        // The caller already queued the immediate first run
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    })
}

/// Single owner of one instrument's mutable state.
struct InstrumentWorker {
    symbol: String,
    cfg: Config,
    tracker: OrderTracker,
    flow: FlowState,
    classifier: OrderClassifier,
    aggregator: SignalAggregator,
    trap: TrapDetector,
    feed: Arc<dyn MarketFeed>,
    store: Arc<Mutex<DetectionStore>>,
    last_detect_ms: Option<u64>,
}

impl InstrumentWorker {
    fn new(
        symbol: &str,
        cfg: Config,
        feed: Arc<dyn MarketFeed>,
        store: Arc<Mutex<DetectionStore>>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            tracker: OrderTracker::new(symbol, cfg.clone()),
            flow: FlowState::new(cfg.cvd_window_ms, cfg.price_history_len, cfg.oi_history_len),
            classifier: OrderClassifier::new(cfg.clone()),
            aggregator: SignalAggregator::new(cfg.clone()),
            trap: TrapDetector::new(cfg.clone()),
            cfg,
            feed,
            store,
            last_detect_ms: None,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<InstrumentEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                InstrumentEvent::Feed(FeedEvent::Depth(snapshot)) => self.on_depth(snapshot),
                InstrumentEvent::Feed(FeedEvent::Trade(print)) => self.on_trade(print),
                InstrumentEvent::FlowTick => self.refresh_flow().await,
                InstrumentEvent::DetectTick => {
                    if let Err(err) = self.run_detect(now_ms()) {
                        json_log_at(
                            Level::Error,
                            Domain::Signal,
                            "detect_cycle_failed",
                            obj(&[
                                ("symbol", v_str(&self.symbol)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
                InstrumentEvent::DetectRequest(reply) => {
                    let _ = reply.send(self.run_detect(now_ms()));
                }
                InstrumentEvent::StatusRequest(reply) => {
                    let _ = reply.send(self.status());
                }
                InstrumentEvent::Stop => break,
            }
        }
    }

    /// Depth path: mid price, price history, tracker update, impact ratios,
    /// reclassification. Any error is confined to this snapshot; the tracker
    /// keeps its last-good state.
    fn on_depth(&mut self, snapshot: DepthSnapshot) {
        let Some(mid) = snapshot.mid_price() else {
            json_log_at(
                Level::Warn,
                Domain::Feed,
                "depth_without_mid_price",
                obj(&[("symbol", v_str(&self.symbol))]),
            );
            return;
        };
        self.flow.record_price(snapshot.ts_ms, mid);

        let result = match self.tracker.update(&snapshot.levels(), mid, snapshot.ts_ms) {
            Ok(result) => result,
            Err(err) => {
                json_log_at(
                    Level::Error,
                    Domain::Tracker,
                    "snapshot_rejected",
                    obj(&[
                        ("symbol", v_str(&self.symbol)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                return;
            }
        };

        let top_n = self.cfg.top_depth_levels;
        for entry in self.tracker.active_entries_mut() {
            let top_value = snapshot.top_value(entry.side, top_n);
            entry.impact_ratio = if top_value > 0.0 { entry.notional / top_value } else { 0.0 };
        }
        self.classifier.classify_batch(self.tracker.active_entries_mut());

        if !result.new_entries.is_empty() || !result.canceled_entries.is_empty() {
            json_log(
                Domain::Tracker,
                "entries_changed",
                obj(&[
                    ("symbol", v_str(&self.symbol)),
                    ("new", v_num(result.new_entries.len() as f64)),
                    ("canceled", v_num(result.canceled_entries.len() as f64)),
                    ("total", v_num(result.total_tracked as f64)),
                ]),
            );
        }
    }

    fn on_trade(&mut self, print: TradePrint) {
        self.tracker.mark_consumed(print.price, print.qty, print.consumed_side);
    }

    /// CVD/OI refresh. Each fetch fails independently; prior flow state is
    /// kept and the next tick retries.
    async fn refresh_flow(&mut self) {
        match self
            .feed
            .fetch_klines(&self.symbol, &self.cfg.cvd_kline_interval, self.cfg.cvd_kline_limit)
            .await
        {
            Ok(klines) => {
                if let Some(last) = klines.last() {
                    self.flow.record_cvd_delta(now_ms(), last.signed_delta());
                }
            }
            Err(err) => {
                json_log_at(
                    Level::Warn,
                    Domain::Feed,
                    "cvd_refresh_failed",
                    obj(&[
                        ("symbol", v_str(&self.symbol)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }

        match self.feed.fetch_open_interest(&self.symbol).await {
            Ok(reading) => self.flow.record_oi(reading.value),
            Err(err) => {
                json_log_at(
                    Level::Warn,
                    Domain::Feed,
                    "oi_refresh_failed",
                    obj(&[
                        ("symbol", v_str(&self.symbol)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }

    /// One full detect-and-persist cycle over the current state.
    fn run_detect(&mut self, ts_ms: u64) -> Result<DetectionRecord> {
        self.classifier.classify_batch(self.tracker.active_entries_mut());
        let active = self.tracker.active_entries();
        // Aggregation and trap validation see the whole retained set: spoofs
        // and flash cancels are exactly the entries that are no longer active
        let all_entries = self.tracker.all_entries();
        let aggregate = self.aggregator.aggregate(
            &all_entries,
            self.flow.cvd.cumulative(),
            self.flow.open_interest(),
            self.flow.prev_open_interest(),
        );

        let price_history = self.flow.price_series();
        let cvd_series = self.flow.cvd.cumulative_series();
        let oi_series = self.flow.oi_series();
        let trap = self.trap.detect(&TrapInputs {
            entries: &all_entries,
            cvd_change: self.flow.cvd.cumulative(),
            oi_change: self.flow.oi_change(),
            price_change: self.flow.price_change(),
            price_history: &price_history,
            cvd_series: &cvd_series,
            oi_series: &oi_series,
            now_ms: ts_ms,
        });

        if trap.detected {
            json_log(
                Domain::Trap,
                "trap_alert",
                obj(&[
                    ("symbol", v_str(&self.symbol)),
                    ("type", v_str(trap.trap_type.as_str())),
                    ("confidence", v_num(trap.confidence)),
                ]),
            );
        }

        let record = DetectionRecord::from_cycle(&self.symbol, ts_ms, &aggregate, &active, Some(&trap));
        json_log(
            Domain::Signal,
            "verdict",
            obj(&[
                ("symbol", v_str(&self.symbol)),
                ("verdict", v_str(aggregate.verdict.as_str())),
                ("buy_score", v_num(aggregate.buy_score)),
                ("sell_score", v_num(aggregate.sell_score)),
                ("cvd", v_num(aggregate.cvd_cumulative)),
                ("spoof_count", v_num(aggregate.spoof_count as f64)),
            ]),
        );

        // Telemetry, not a ledger: a failed write is logged and dropped
        let persisted = match self.store.lock() {
            Ok(mut store) => store.insert_detection(&record),
            Err(_) => Err(anyhow!("detection store lock poisoned")),
        };
        if let Err(err) = persisted {
            json_log_at(
                Level::Error,
                Domain::Store,
                "detection_persist_failed",
                obj(&[
                    ("symbol", v_str(&self.symbol)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }

        self.last_detect_ms = Some(ts_ms);
        Ok(record)
    }

    fn status(&self) -> InstrumentStatus {
        InstrumentStatus {
            symbol: self.symbol.clone(),
            cvd_cumulative: self.flow.cvd.cumulative(),
            open_interest: self.flow.open_interest(),
            tracker: self.tracker.stats(),
            last_detect_ms: self.last_detect_ms,
        }
    }
}
