//! Lifecycle tracking of large resting orders.
//!
//! One tracker instance per monitored instrument. Successive depth snapshots
//! drive entry creation, refresh, cancellation and spoof flagging; trade
//! prints reconcile observed consumption. All state is in-memory and bounded:
//! canceled entries age out after a fixed retention, and the live set is
//! capped with oldest-by-last-seen eviction.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::book::{BookLevel, Side};
use crate::classifier::Classification;
use crate::config::Config;

/// Price keying resolution. Levels closer than this collapse to one key.
const PRICE_TICK: f64 = 1e-8;

#[derive(Debug, Error, PartialEq)]
pub enum TrackError {
    #[error("non-finite or non-positive price {0} in depth snapshot")]
    BadPrice(f64),
    #[error("non-finite or negative quantity {0} in depth snapshot")]
    BadQty(f64),
    #[error("reference price must be positive and finite, got {0}")]
    BadReferencePrice(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EntryKey {
    side: Side,
    price_ticks: i64,
}

impl EntryKey {
    fn new(side: Side, price: f64) -> Self {
        Self { side, price_ticks: (price / PRICE_TICK).round() as i64 }
    }
}

/// A tracked large order at one price level.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    /// qty × reference price at the last refresh, in quote units.
    pub notional: f64,
    pub created_at: u64,
    pub last_seen_at: u64,
    /// Set exactly once, when the level first disappears from a snapshot.
    pub canceled_at: Option<u64>,
    pub seen_count: u32,
    /// Observed fills attributed to this level. Never exceeds qty.
    pub filled_volume_observed: f64,
    pub impact_ratio: f64,
    pub classification: Classification,
    pub is_persistent: bool,
    pub is_spoof: bool,
    pub was_consumed: bool,
}

impl TrackedEntry {
    fn new(side: Side, price: f64, qty: f64, notional: f64, ts_ms: u64) -> Self {
        Self {
            side,
            price,
            qty,
            notional,
            created_at: ts_ms,
            last_seen_at: ts_ms,
            canceled_at: None,
            seen_count: 1,
            filled_volume_observed: 0.0,
            impact_ratio: 0.0,
            classification: Classification::Unknown,
            is_persistent: false,
            is_spoof: false,
            was_consumed: false,
        }
    }

    pub fn lifespan_ms(&self, now_ms: u64) -> u64 {
        self.canceled_at.unwrap_or(now_ms).saturating_sub(self.created_at)
    }

    pub fn filled_ratio(&self) -> f64 {
        if self.qty > 0.0 {
            self.filled_volume_observed / self.qty
        } else {
            0.0
        }
    }
}

/// Outcome of applying one snapshot.
#[derive(Debug, Default)]
pub struct UpdateResult {
    pub new_entries: Vec<TrackedEntry>,
    pub updated_entries: Vec<TrackedEntry>,
    pub canceled_entries: Vec<TrackedEntry>,
    pub total_tracked: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackerStats {
    pub total: usize,
    pub active: usize,
    pub persistent: usize,
    pub spoof: usize,
    pub consumed: usize,
}

pub struct OrderTracker {
    symbol: String,
    cfg: Config,
    entries: HashMap<EntryKey, TrackedEntry>,
}

impl OrderTracker {
    pub fn new(symbol: &str, cfg: Config) -> Self {
        Self { symbol: symbol.to_string(), cfg, entries: HashMap::new() }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply one depth snapshot.
    ///
    /// Filters levels to notional ≥ threshold, creates or refreshes entries
    /// for qualifying keys, cancels entries whose level vanished, flags quick
    /// non-persistent cancels as spoofs, then prunes and enforces the cap.
    pub fn update(
        &mut self,
        snapshot: &[BookLevel],
        reference_price: f64,
        ts_ms: u64,
    ) -> Result<UpdateResult, TrackError> {
        if !reference_price.is_finite() || reference_price <= 0.0 {
            return Err(TrackError::BadReferencePrice(reference_price));
        }
        for level in snapshot {
            if !level.price.is_finite() || level.price <= 0.0 {
                return Err(TrackError::BadPrice(level.price));
            }
            if !level.qty.is_finite() || level.qty < 0.0 {
                return Err(TrackError::BadQty(level.qty));
            }
        }

        let mut result = UpdateResult::default();
        let mut current_keys: HashSet<EntryKey> = HashSet::new();

        for level in snapshot {
            let notional = level.qty * reference_price;
            if level.qty <= 0.0 || notional < self.cfg.notional_threshold {
                continue;
            }
            let key = EntryKey::new(level.side, level.price);
            current_keys.insert(key);

            match self.entries.entry(key) {
                Entry::Occupied(mut slot) if slot.get().canceled_at.is_none() => {
                    let entry = slot.get_mut();
                    entry.qty = level.qty;
                    entry.notional = notional;
                    entry.last_seen_at = ts_ms;
                    entry.seen_count += 1;
                    if entry.seen_count >= self.cfg.persist_snapshots {
                        entry.is_persistent = true;
                    }
                    result.updated_entries.push(entry.clone());
                }
                Entry::Occupied(mut slot) => {
                    // Fresh order at a price whose previous occupant was
                    // already canceled. The canceled record is superseded;
                    // its canceled_at was set once and its lifecycle is over.
                    let entry =
                        TrackedEntry::new(level.side, level.price, level.qty, notional, ts_ms);
                    slot.insert(entry.clone());
                    result.new_entries.push(entry);
                }
                Entry::Vacant(slot) => {
                    let entry =
                        TrackedEntry::new(level.side, level.price, level.qty, notional, ts_ms);
                    slot.insert(entry.clone());
                    result.new_entries.push(entry);
                }
            }
        }

        for entry in self.entries.values_mut() {
            if entry.canceled_at.is_some() {
                continue;
            }
            let key = EntryKey::new(entry.side, entry.price);
            if current_keys.contains(&key) {
                continue;
            }
            entry.canceled_at = Some(ts_ms);
            let lifespan = ts_ms.saturating_sub(entry.created_at);
            if lifespan < self.cfg.spoof_window_ms && !entry.is_persistent {
                entry.is_spoof = true;
                entry.classification = Classification::Spoof;
            }
            result.canceled_entries.push(entry.clone());
        }

        self.prune(ts_ms);
        result.total_tracked = self.entries.len();
        Ok(result)
    }

    /// Drop canceled entries past retention, then enforce the cap by evicting
    /// oldest-by-last-seen, canceled entries first.
    fn prune(&mut self, ts_ms: u64) {
        let retention = self.cfg.retention_ms;
        self.entries.retain(|_, e| match e.canceled_at {
            Some(at) => ts_ms.saturating_sub(at) <= retention,
            None => true,
        });

        let cap = self.cfg.max_tracked_entries;
        if self.entries.len() <= cap {
            return;
        }
        let mut victims: Vec<(EntryKey, bool, u64)> = self
            .entries
            .iter()
            .map(|(k, e)| (*k, e.canceled_at.is_some(), e.last_seen_at))
            .collect();
        // Canceled before active, then oldest last_seen first
        victims.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        let excess = self.entries.len() - cap;
        for (key, _, _) in victims.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }

    /// Reconcile a trade print against tracked entries on the consumed side,
    /// within the configured price tolerance.
    pub fn mark_consumed(&mut self, price: f64, qty: f64, side: Side) {
        if !price.is_finite() || price <= 0.0 || !qty.is_finite() || qty <= 0.0 {
            return;
        }
        for entry in self.entries.values_mut() {
            if entry.side != side || entry.canceled_at.is_some() {
                continue;
            }
            let diff = (entry.price - price).abs() / entry.price;
            if diff <= self.cfg.price_tolerance {
                entry.filled_volume_observed =
                    (entry.filled_volume_observed + qty).min(entry.qty);
                entry.was_consumed = true;
            }
        }
    }

    /// Active (non-canceled) entries, largest notional first.
    pub fn active_entries(&self) -> Vec<TrackedEntry> {
        let mut out: Vec<TrackedEntry> = self
            .entries
            .values()
            .filter(|e| e.canceled_at.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.notional.partial_cmp(&a.notional).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Mutable access to active entries, for impact-ratio refresh and
    /// reclassification on the depth path.
    pub fn active_entries_mut(&mut self) -> Vec<&mut TrackedEntry> {
        self.entries.values_mut().filter(|e| e.canceled_at.is_none()).collect()
    }

    /// Every retained entry including canceled ones, most recent first.
    pub fn all_entries(&self) -> Vec<TrackedEntry> {
        let mut out: Vec<TrackedEntry> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        out
    }

    pub fn stats(&self) -> TrackerStats {
        let mut stats = TrackerStats { total: self.entries.len(), ..Default::default() };
        for e in self.entries.values() {
            if e.canceled_at.is_none() {
                stats.active += 1;
            }
            if e.is_persistent {
                stats.persistent += 1;
            }
            if e.is_spoof {
                stats.spoof += 1;
            }
            if e.was_consumed {
                stats.consumed += 1;
            }
        }
        stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            notional_threshold: 100_000_000.0,
            persist_snapshots: 3,
            spoof_window_ms: 3_000,
            retention_ms: 3_600_000,
            max_tracked_entries: 100,
            price_tolerance: 0.0005,
            ..Config::default()
        }
    }

    fn bid(price: f64, qty: f64) -> BookLevel {
        BookLevel { side: Side::Bid, price, qty }
    }

    fn ask(price: f64, qty: f64) -> BookLevel {
        BookLevel { side: Side::Ask, price, qty }
    }

    // =========================================================================
    // Entry creation and refresh
    // =========================================================================

    #[test]
    fn test_new_large_entry_starts_unknown() {
        // Single bid, notional 2000 * 100_000 = 200M >= 100M threshold
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        let result = tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();

        assert_eq!(result.new_entries.len(), 1);
        assert_eq!(result.total_tracked, 1);
        let entry = &result.new_entries[0];
        assert_eq!(entry.notional, 200_000_000.0);
        assert_eq!(entry.classification, Classification::Unknown);
        assert!(!entry.is_persistent);
        assert_eq!(entry.seen_count, 1);
    }

    #[test]
    fn test_below_threshold_ignored() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        let result = tracker.update(&[bid(100_000.0, 0.5)], 100_000.0, 1_000).unwrap();
        assert!(result.new_entries.is_empty());
        assert_eq!(result.total_tracked, 0);
    }

    #[test]
    fn test_persistence_on_third_snapshot() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        let levels = [bid(100_000.0, 2_000.0)];
        tracker.update(&levels, 100_000.0, 1_000).unwrap();
        let r2 = tracker.update(&levels, 100_000.0, 2_000).unwrap();
        assert!(!r2.updated_entries[0].is_persistent, "persistent too early");
        let r3 = tracker.update(&levels, 100_000.0, 3_000).unwrap();
        assert!(r3.updated_entries[0].is_persistent, "persistent on 3rd sighting");
        assert_eq!(r3.updated_entries[0].seen_count, 3);
    }

    // =========================================================================
    // Cancellation and spoof flagging
    // =========================================================================

    #[test]
    fn test_quick_cancel_flagged_spoof() {
        // Lives 1500ms then vanishes; spoof window 3000ms, not persistent
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[ask(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        let result = tracker.update(&[], 100_000.0, 2_500).unwrap();

        assert_eq!(result.canceled_entries.len(), 1);
        let entry = &result.canceled_entries[0];
        assert_eq!(entry.canceled_at, Some(2_500));
        assert!(entry.is_spoof);
        assert_eq!(entry.classification, Classification::Spoof);
    }

    #[test]
    fn test_slow_cancel_not_spoof() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[ask(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        let result = tracker.update(&[], 100_000.0, 10_000).unwrap();
        assert!(!result.canceled_entries[0].is_spoof);
    }

    #[test]
    fn test_persistent_quick_cancel_not_spoof() {
        let mut cfg = test_config();
        cfg.persist_snapshots = 2;
        cfg.spoof_window_ms = 10_000;
        let mut tracker = OrderTracker::new("BTCUSDT", cfg);
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_500).unwrap();
        let result = tracker.update(&[], 100_000.0, 2_000).unwrap();
        assert!(!result.canceled_entries[0].is_spoof, "persistent entries are never spoofs");
    }

    #[test]
    fn test_canceled_at_set_once_and_active_keys_clean() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        tracker.update(&[], 100_000.0, 2_000).unwrap();
        // Further empty snapshots must not re-cancel
        let r = tracker.update(&[], 100_000.0, 3_000).unwrap();
        assert!(r.canceled_entries.is_empty());
        for e in tracker.active_entries() {
            assert!(e.canceled_at.is_none());
        }
    }

    #[test]
    fn test_reappearing_key_starts_fresh_lifecycle() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        tracker.update(&[], 100_000.0, 2_000).unwrap();
        let r = tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 3_000).unwrap();
        assert_eq!(r.new_entries.len(), 1, "reappearance is a new entry, not a refresh");
        assert_eq!(r.new_entries[0].seen_count, 1);
        assert_eq!(r.new_entries[0].created_at, 3_000);
    }

    // =========================================================================
    // Pruning and cap enforcement
    // =========================================================================

    #[test]
    fn test_canceled_pruned_after_retention() {
        let mut cfg = test_config();
        cfg.retention_ms = 1_000;
        let mut tracker = OrderTracker::new("BTCUSDT", cfg);
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        tracker.update(&[], 100_000.0, 2_000).unwrap();
        assert_eq!(tracker.stats().total, 1);
        // Next update past retention drops it
        tracker.update(&[], 100_000.0, 3_500).unwrap();
        assert_eq!(tracker.stats().total, 0);
    }

    #[test]
    fn test_cap_never_exceeded_and_oldest_evicted() {
        let mut cfg = test_config();
        cfg.max_tracked_entries = 5;
        cfg.spoof_window_ms = 0; // keep cancellations plain
        let mut tracker = OrderTracker::new("BTCUSDT", cfg);

        // Walk a bid across 12 prices, one per snapshot: each step cancels the
        // previous level and adds a new one.
        for i in 0..12u64 {
            let price = 100_000.0 + i as f64 * 10.0;
            tracker.update(&[bid(price, 2_000.0)], 100_000.0, 1_000 + i * 100).unwrap();
            assert!(tracker.stats().total <= 5, "cap exceeded at step {}", i);
        }
        // The single active entry must have survived every eviction pass
        assert_eq!(tracker.active_entries().len(), 1);
        assert_eq!(tracker.active_entries()[0].price, 100_110.0);
        // Retained canceled entries are the most recently seen ones
        let all = tracker.all_entries();
        let oldest_kept = all.iter().map(|e| e.last_seen_at).min().unwrap();
        assert!(oldest_kept >= 1_700, "evicted the wrong generation: {}", oldest_kept);
    }

    // =========================================================================
    // Consumption reconciliation
    // =========================================================================

    #[test]
    fn test_mark_consumed_within_tolerance() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();

        // 0.03% away: inside the 0.05% tolerance
        tracker.mark_consumed(100_030.0, 50.0, Side::Bid);
        let entry = &tracker.active_entries()[0];
        assert!(entry.was_consumed);
        assert_eq!(entry.filled_volume_observed, 50.0);
    }

    #[test]
    fn test_mark_consumed_outside_tolerance_ignored() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        tracker.mark_consumed(100_200.0, 50.0, Side::Bid);
        assert!(!tracker.active_entries()[0].was_consumed);
    }

    #[test]
    fn test_mark_consumed_wrong_side_ignored() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        tracker.mark_consumed(100_000.0, 50.0, Side::Ask);
        assert!(!tracker.active_entries()[0].was_consumed);
    }

    #[test]
    fn test_filled_volume_clamped_to_qty() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();
        tracker.mark_consumed(100_000.0, 1_500.0, Side::Bid);
        tracker.mark_consumed(100_000.0, 1_500.0, Side::Bid);
        let entry = &tracker.active_entries()[0];
        assert!(entry.filled_volume_observed <= entry.qty);
        assert_eq!(entry.filled_volume_observed, 2_000.0);
    }

    // =========================================================================
    // Contract violations
    // =========================================================================

    #[test]
    fn test_bad_reference_price_rejected() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        let err = tracker.update(&[bid(100_000.0, 2_000.0)], 0.0, 1_000).unwrap_err();
        assert_eq!(err, TrackError::BadReferencePrice(0.0));
        let err = tracker.update(&[bid(100_000.0, 2_000.0)], f64::NAN, 1_000).unwrap_err();
        assert!(matches!(err, TrackError::BadReferencePrice(_)));
    }

    #[test]
    fn test_malformed_level_rejected_and_state_intact() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_000).unwrap();

        let err = tracker.update(&[bid(-1.0, 2_000.0)], 100_000.0, 2_000).unwrap_err();
        assert!(matches!(err, TrackError::BadPrice(_)));
        let err = tracker.update(&[bid(100_000.0, f64::INFINITY)], 100_000.0, 2_000).unwrap_err();
        assert!(matches!(err, TrackError::BadQty(_)));

        // Last-good state untouched: entry still active with seen_count 1
        let entries = tracker.active_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seen_count, 1);
        assert!(entries[0].canceled_at.is_none());
    }

    #[test]
    fn test_stats_counts() {
        let mut tracker = OrderTracker::new("BTCUSDT", test_config());
        tracker
            .update(&[bid(100_000.0, 2_000.0), ask(101_000.0, 2_000.0)], 100_000.0, 1_000)
            .unwrap();
        tracker.update(&[bid(100_000.0, 2_000.0)], 100_000.0, 1_500).unwrap();

        let stats = tracker.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.spoof, 1); // quick ask cancel inside spoof window
    }
}
