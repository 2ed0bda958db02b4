//! Bull/bear trap validation.
//!
//! Three independent checks over a point-in-time view of the tracked book:
//! persistence (how long orders actually rest), execution (whether they trade
//! or just cancel, and whether flow agrees with the side they advertise), and
//! temporal sequence (trend synchronization and spike-then-reversal). The
//! weighted composite only fires against the dominant side of the book.

use serde::{Deserialize, Serialize};

use crate::book::Side;
use crate::config::Config;
use crate::tracker::TrackedEntry;

/// Fraction of flash cancels that makes the flash indicator fire.
const FLASH_RATIO_GATE: f64 = 0.5;
/// Relative price move that qualifies as a spike.
const SPIKE_MOVE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrapType {
    BullTrap,
    BearTrap,
    None,
}

impl TrapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrapType::BullTrap => "BULL_TRAP",
            TrapType::BearTrap => "BEAR_TRAP",
            TrapType::None => "NONE",
        }
    }
}

/// Everything the detector needs for one pass, assembled by the orchestrator.
#[derive(Debug, Clone)]
pub struct TrapInputs<'a> {
    pub entries: &'a [TrackedEntry],
    pub cvd_change: f64,
    pub oi_change: f64,
    pub price_change: f64,
    pub price_history: &'a [f64],
    pub cvd_series: &'a [f64],
    pub oi_series: &'a [f64],
    pub now_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceStats {
    pub persistent_count: usize,
    pub flash_count: usize,
    pub avg_duration_ms: f64,
    pub flash_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionStats {
    pub filled_count: usize,
    pub canceled_count: usize,
    pub avg_filled_ratio: f64,
    pub avg_cancel_ratio: f64,
    pub cvd_aligned: bool,
    pub oi_aligned: bool,
    pub price_aligned: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemporalStats {
    pub synchronized: bool,
    pub spike_detected: bool,
    pub price_trend: i8,
    pub cvd_trend: i8,
    pub oi_trend: i8,
}

/// Indicator bundle carried into the persisted detection record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrapIndicators {
    pub avg_duration_ms: f64,
    pub persistent_count: usize,
    pub flash_count: usize,
    pub filled_ratio: f64,
    pub cancel_ratio: f64,
    pub cvd_aligned: bool,
    pub oi_aligned: bool,
    pub price_aligned: bool,
    pub synchronized: bool,
    pub spike_detected: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TrapResult {
    pub detected: bool,
    pub trap_type: TrapType,
    pub confidence: f64,
    pub indicators: Option<TrapIndicators>,
}

impl TrapResult {
    fn none() -> Self {
        Self { detected: false, trap_type: TrapType::None, confidence: 0.0, indicators: None }
    }
}

pub struct TrapDetector {
    cfg: Config,
}

impl TrapDetector {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Persistence check: how long do tracked orders actually rest.
    pub fn check_persistence(&self, entries: &[TrackedEntry], now_ms: u64) -> PersistenceStats {
        let mut stats = PersistenceStats::default();
        let mut total_duration = 0.0;

        for entry in entries {
            let duration = entry.lifespan_ms(now_ms);
            if duration >= self.cfg.persistence_threshold_ms {
                stats.persistent_count += 1;
            } else if entry.canceled_at.is_some() && duration <= self.cfg.flash_threshold_ms {
                stats.flash_count += 1;
            }
            total_duration += duration as f64;
        }

        if !entries.is_empty() {
            stats.avg_duration_ms = total_duration / entries.len() as f64;
            stats.flash_ratio = stats.flash_count as f64 / entries.len() as f64;
        }
        stats
    }

    /// Execution check: did the advertised size trade, and does flow agree
    /// with the side the book is showing.
    pub fn check_execution(
        &self,
        entries: &[TrackedEntry],
        cvd_change: f64,
        oi_change: f64,
        price_change: f64,
    ) -> ExecutionStats {
        let mut stats = ExecutionStats::default();
        let mut total_filled = 0.0;
        let mut total_canceled = 0.0;

        for entry in entries {
            if entry.was_consumed {
                stats.filled_count += 1;
                total_filled += entry.filled_ratio();
            }
            if entry.canceled_at.is_some() {
                stats.canceled_count += 1;
                total_canceled += 1.0 - entry.filled_ratio();
            }
        }
        if stats.filled_count > 0 {
            stats.avg_filled_ratio = total_filled / stats.filled_count as f64;
        }
        if stats.canceled_count > 0 {
            stats.avg_cancel_ratio = total_canceled / stats.canceled_count as f64;
        }

        let has_bids = entries.iter().any(|e| e.side == Side::Bid);
        let has_asks = entries.iter().any(|e| e.side == Side::Ask);

        stats.cvd_aligned =
            (has_bids && cvd_change > 0.0) || (has_asks && cvd_change < 0.0);
        stats.oi_aligned = oi_change.abs() > 0.0;
        stats.price_aligned =
            (has_bids && price_change > 0.0) || (has_asks && price_change < 0.0);
        stats
    }

    /// Temporal check: trend synchronization across price/CVD/OI, plus
    /// spike-then-reversal evidence.
    pub fn check_temporal(
        &self,
        price_history: &[f64],
        cvd_series: &[f64],
        oi_series: &[f64],
    ) -> TemporalStats {
        let mut stats = TemporalStats::default();
        if price_history.len() < 2 {
            return stats;
        }

        let trend = |series: &[f64]| -> i8 {
            if series.len() < 2 {
                return 0;
            }
            let (first, last) = (series[0], series[series.len() - 1]);
            if last > first {
                1
            } else if last < first {
                -1
            } else {
                0
            }
        };

        stats.price_trend = trend(price_history);
        stats.cvd_trend = trend(cvd_series);
        stats.oi_trend = trend(oi_series);
        stats.synchronized = stats.price_trend == stats.cvd_trend && stats.price_trend != 0;

        if price_history.len() >= 3 {
            let first = price_history[0];
            let mid = price_history[price_history.len() / 2];
            let last = price_history[price_history.len() - 1];
            if first > 0.0 {
                let volatility = (mid - first).abs() / first;
                let reversal = (mid > first && last < mid) || (mid < first && last > mid);
                stats.spike_detected = volatility > SPIKE_MOVE && reversal;
            }
        }
        stats
    }

    pub fn detect(&self, inputs: &TrapInputs) -> TrapResult {
        if inputs.entries.is_empty() {
            return TrapResult::none();
        }

        let persistence = self.check_persistence(inputs.entries, inputs.now_ms);
        let execution = self.check_execution(
            inputs.entries,
            inputs.cvd_change,
            inputs.oi_change,
            inputs.price_change,
        );
        let temporal =
            self.check_temporal(inputs.price_history, inputs.cvd_series, inputs.oi_series);

        let flash_orders =
            persistence.flash_count > 0 && persistence.flash_ratio > FLASH_RATIO_GATE;
        let high_cancel_ratio = execution.avg_cancel_ratio > self.cfg.cancel_ratio_threshold;
        let low_filled_ratio = execution.avg_filled_ratio < self.cfg.filled_ratio_threshold;

        let score = (if flash_orders { 0.25 } else { 0.0 })
            + (if high_cancel_ratio { 0.30 } else { 0.0 })
            + (if low_filled_ratio { 0.15 } else { 0.0 })
            + (if !execution.cvd_aligned { 0.15 } else { 0.0 })
            + (if !execution.price_aligned { 0.10 } else { 0.0 })
            + (if temporal.spike_detected { 0.05 } else { 0.0 });

        let bid_count = inputs.entries.iter().filter(|e| e.side == Side::Bid).count();
        let ask_count = inputs.entries.len() - bid_count;
        let dominant = if bid_count > ask_count { Side::Bid } else { Side::Ask };

        let (detected, trap_type, confidence) = if score >= self.cfg.min_trap_confidence {
            let ty = match dominant {
                Side::Bid => TrapType::BullTrap,
                Side::Ask => TrapType::BearTrap,
            };
            (true, ty, (score * 100.0).round() / 100.0)
        } else {
            (false, TrapType::None, 0.0)
        };

        TrapResult {
            detected,
            trap_type,
            confidence,
            indicators: Some(TrapIndicators {
                avg_duration_ms: persistence.avg_duration_ms,
                persistent_count: persistence.persistent_count,
                flash_count: persistence.flash_count,
                filled_ratio: execution.avg_filled_ratio,
                cancel_ratio: execution.avg_cancel_ratio,
                cvd_aligned: execution.cvd_aligned,
                oi_aligned: execution.oi_aligned,
                price_aligned: execution.price_aligned,
                synchronized: temporal.synchronized,
                spike_detected: temporal.spike_detected,
            }),
        }
    }
}
