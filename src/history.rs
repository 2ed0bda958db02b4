//! Batch roll-up of persisted detection snapshots.
//!
//! Replays the serialized entry snapshots from a multi-day window and folds
//! them into per-price-level statistics: how big each resting order got, when
//! it was first and last observed, and how often it reappeared. Purely a
//! summarizer over already-persisted rows, with no live state involved.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::Result;

use crate::book::Side;
use crate::logging::{json_log_at, obj, v_num, v_str, Domain, Level};
use crate::storage::{DetectionStore, StoredDetection};

/// First seen within the last hour.
const NEW_WINDOW_MS: u64 = 3_600_000;
/// Last seen within the last fifteen minutes.
const ACTIVE_WINDOW_MS: u64 = 900_000;

/// Price keying resolution for matching snapshots across records.
const PRICE_TICK: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct AggregatedOrder {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub max_notional: f64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub appearances: u32,
    pub is_new: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolHistory {
    pub total_orders: usize,
    pub buy_orders: usize,
    pub sell_orders: usize,
    pub total_value: f64,
    pub buy_value: f64,
    pub sell_value: f64,
    pub buy_value_ratio: f64,
    pub sell_value_ratio: f64,
    pub orders: Vec<AggregatedOrder>,
}

pub struct HistoryAggregator {
    /// Snapshots below this notional are ignored in the roll-up.
    pub min_notional: f64,
}

impl HistoryAggregator {
    pub fn new(min_notional: f64) -> Self {
        Self { min_notional }
    }

    /// Fold one symbol's detection rows into per-level lifecycle stats,
    /// sorted by max notional descending.
    pub fn aggregate_orders(
        &self,
        records: &[StoredDetection],
        symbol: &str,
        now_ms: u64,
    ) -> SymbolHistory {
        #[derive(Debug)]
        struct Lifecycle {
            side: Side,
            price: f64,
            max_notional: f64,
            first_seen: u64,
            last_seen: u64,
            appearances: u32,
        }

        let mut lifecycle: HashMap<(Side, i64), Lifecycle> = HashMap::new();

        for record in records {
            if record.symbol != symbol {
                continue;
            }
            for entry in &record.payload.entries {
                if entry.notional < self.min_notional {
                    continue;
                }
                let key = (entry.side, (entry.price / PRICE_TICK).round() as i64);
                match lifecycle.entry(key) {
                    Entry::Occupied(mut slot) => {
                        let order = slot.get_mut();
                        order.first_seen = order.first_seen.min(record.ts_ms);
                        order.last_seen = order.last_seen.max(record.ts_ms);
                        order.max_notional = order.max_notional.max(entry.notional);
                        order.appearances += 1;
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Lifecycle {
                            side: entry.side,
                            price: entry.price,
                            max_notional: entry.notional,
                            first_seen: record.ts_ms,
                            last_seen: record.ts_ms,
                            appearances: 1,
                        });
                    }
                }
            }
        }

        let mut orders: Vec<AggregatedOrder> = lifecycle
            .into_values()
            .map(|o| AggregatedOrder {
                symbol: symbol.to_string(),
                side: o.side,
                price: o.price,
                max_notional: o.max_notional,
                first_seen: o.first_seen,
                last_seen: o.last_seen,
                appearances: o.appearances,
                is_new: now_ms.saturating_sub(o.first_seen) < NEW_WINDOW_MS,
                is_active: now_ms.saturating_sub(o.last_seen) < ACTIVE_WINDOW_MS,
            })
            .collect();
        orders.sort_by(|a, b| {
            b.max_notional.partial_cmp(&a.max_notional).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut history = SymbolHistory { total_orders: orders.len(), ..Default::default() };
        for order in &orders {
            history.total_value += order.max_notional;
            match order.side {
                Side::Bid => {
                    history.buy_orders += 1;
                    history.buy_value += order.max_notional;
                }
                Side::Ask => {
                    history.sell_orders += 1;
                    history.sell_value += order.max_notional;
                }
            }
        }
        if history.total_value > 0.0 {
            history.buy_value_ratio = history.buy_value / history.total_value * 100.0;
            history.sell_value_ratio = history.sell_value / history.total_value * 100.0;
        }
        history.orders = orders;
        history
    }

    /// Roll up several symbols from the store. A symbol whose rows cannot be
    /// read is skipped with a log line; the rest still aggregate.
    pub fn aggregate_symbols(
        &self,
        store: &DetectionStore,
        symbols: &[String],
        window_ms: u64,
        now_ms: u64,
    ) -> Result<HashMap<String, SymbolHistory>> {
        let since = now_ms.saturating_sub(window_ms);
        let mut out = HashMap::new();
        for symbol in symbols {
            match store.recent_detections(symbol, since) {
                Ok(records) => {
                    let history = self.aggregate_orders(&records, symbol, now_ms);
                    json_log_at(
                        Level::Debug,
                        Domain::Store,
                        "history_aggregated",
                        obj(&[
                            ("symbol", v_str(symbol)),
                            ("records", v_num(records.len() as f64)),
                            ("orders", v_num(history.total_orders as f64)),
                        ]),
                    );
                    out.insert(symbol.clone(), history);
                }
                Err(err) => {
                    json_log_at(
                        Level::Error,
                        Domain::Store,
                        "history_aggregation_failed",
                        obj(&[("symbol", v_str(symbol)), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classification;
    use crate::record::{DetectionPayload, EntrySnapshot};

    fn snapshot_entry(side: Side, price: f64, notional: f64) -> EntrySnapshot {
        EntrySnapshot {
            side,
            price,
            qty: notional / price,
            notional,
            impact_ratio: 0.0,
            classification: Classification::Unknown,
            is_persistent: false,
            is_spoof: false,
            was_consumed: false,
            created_at: 0,
            last_seen_at: 0,
        }
    }

    fn stored(symbol: &str, ts_ms: u64, entries: Vec<EntrySnapshot>) -> StoredDetection {
        StoredDetection {
            symbol: symbol.to_string(),
            ts_ms,
            verdict: "NEUTRAL".to_string(),
            payload: DetectionPayload {
                version: 1,
                entries,
                trap: None,
                extensions: serde_json::Map::new(),
            },
        }
    }

    const HOUR: u64 = 3_600_000;

    #[test]
    fn test_lifecycle_accumulation() {
        let agg = HistoryAggregator::new(10_000_000.0);
        let now = 10 * HOUR;
        let records = vec![
            stored("BTCUSDT", HOUR, vec![snapshot_entry(Side::Bid, 100_000.0, 50_000_000.0)]),
            stored("BTCUSDT", 2 * HOUR, vec![snapshot_entry(Side::Bid, 100_000.0, 80_000_000.0)]),
            stored("BTCUSDT", 3 * HOUR, vec![snapshot_entry(Side::Bid, 100_000.0, 60_000_000.0)]),
        ];
        let history = agg.aggregate_orders(&records, "BTCUSDT", now);
        assert_eq!(history.total_orders, 1);
        let order = &history.orders[0];
        assert_eq!(order.appearances, 3);
        assert_eq!(order.max_notional, 80_000_000.0);
        assert_eq!(order.first_seen, HOUR);
        assert_eq!(order.last_seen, 3 * HOUR);
        assert!(!order.is_new);
        assert!(!order.is_active);
    }

    #[test]
    fn test_is_new_and_is_active_edges() {
        let agg = HistoryAggregator::new(0.0);
        let now = 10 * HOUR;
        let records = vec![
            // First seen 30 minutes ago, last seen 5 minutes ago
            stored("BTCUSDT", now - 30 * 60_000, vec![snapshot_entry(Side::Ask, 101_000.0, 2e7)]),
            stored("BTCUSDT", now - 5 * 60_000, vec![snapshot_entry(Side::Ask, 101_000.0, 2e7)]),
        ];
        let history = agg.aggregate_orders(&records, "BTCUSDT", now);
        let order = &history.orders[0];
        assert!(order.is_new);
        assert!(order.is_active);
    }

    #[test]
    fn test_sorted_by_max_notional_desc() {
        let agg = HistoryAggregator::new(0.0);
        let records = vec![stored(
            "BTCUSDT",
            HOUR,
            vec![
                snapshot_entry(Side::Bid, 99_000.0, 1e7),
                snapshot_entry(Side::Ask, 102_000.0, 9e7),
                snapshot_entry(Side::Bid, 100_000.0, 5e7),
            ],
        )];
        let history = agg.aggregate_orders(&records, "BTCUSDT", 2 * HOUR);
        let values: Vec<f64> = history.orders.iter().map(|o| o.max_notional).collect();
        assert_eq!(values, vec![9e7, 5e7, 1e7]);
    }

    #[test]
    fn test_min_notional_filter_and_side_stats() {
        let agg = HistoryAggregator::new(3e7);
        let records = vec![stored(
            "BTCUSDT",
            HOUR,
            vec![
                snapshot_entry(Side::Bid, 100_000.0, 6e7),
                snapshot_entry(Side::Ask, 102_000.0, 4e7),
                snapshot_entry(Side::Bid, 99_000.0, 1e7), // below floor
            ],
        )];
        let history = agg.aggregate_orders(&records, "BTCUSDT", 2 * HOUR);
        assert_eq!(history.total_orders, 2);
        assert_eq!(history.buy_orders, 1);
        assert_eq!(history.sell_orders, 1);
        assert_eq!(history.buy_value, 6e7);
        assert_eq!(history.sell_value, 4e7);
        assert!((history.buy_value_ratio - 60.0).abs() < 1e-9);
        assert!((history.sell_value_ratio - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_other_symbols_excluded() {
        let agg = HistoryAggregator::new(0.0);
        let records = vec![
            stored("BTCUSDT", HOUR, vec![snapshot_entry(Side::Bid, 100_000.0, 5e7)]),
            stored("ETHUSDT", HOUR, vec![snapshot_entry(Side::Bid, 3_000.0, 5e7)]),
        ];
        let history = agg.aggregate_orders(&records, "BTCUSDT", 2 * HOUR);
        assert_eq!(history.total_orders, 1);
        assert_eq!(history.orders[0].price, 100_000.0);
    }

    #[test]
    fn test_aggregate_symbols_from_store() {
        let mut store = DetectionStore::in_memory().unwrap();
        store.init().unwrap();

        let aggregate = crate::aggregator::AggregateResult {
            verdict: crate::aggregator::Verdict::Neutral,
            buy_score: 0.0,
            sell_score: 0.0,
            cvd_cumulative: 0.0,
            open_interest: None,
            oi_change_pct: 0.0,
            spoof_count: 0,
            tracked_entry_count: 1,
        };
        let entry = crate::tracker::TrackedEntry {
            side: Side::Bid,
            price: 100_000.0,
            qty: 500.0,
            notional: 5e7,
            created_at: HOUR,
            last_seen_at: HOUR,
            canceled_at: None,
            seen_count: 1,
            filled_volume_observed: 0.0,
            impact_ratio: 0.0,
            classification: Classification::Unknown,
            is_persistent: false,
            is_spoof: false,
            was_consumed: false,
        };
        let record = crate::record::DetectionRecord::from_cycle(
            "BTCUSDT",
            HOUR,
            &aggregate,
            &[entry],
            None,
        );
        store.insert_detection(&record).unwrap();

        let agg = HistoryAggregator::new(0.0);
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let result = agg.aggregate_symbols(&store, &symbols, 24 * HOUR, 2 * HOUR).unwrap();
        assert_eq!(result["BTCUSDT"].total_orders, 1);
        assert_eq!(result["ETHUSDT"].total_orders, 0);
    }
}
