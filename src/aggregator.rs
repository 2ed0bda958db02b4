//! Instrument-level verdict from classified entries plus flow context.
//!
//! `aggregate` is a pure function: identical inputs always produce the same
//! verdict and scores.

use serde::{Deserialize, Serialize};

use crate::book::Side;
use crate::config::Config;
use crate::tracker::TrackedEntry;

/// Notional divisor that normalizes entry scores (1.0 per 100M quote units).
const NOTIONAL_SCALE: f64 = 1e8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    AccumulateMarkup,
    DistributionMarkdown,
    Manipulation,
    Neutral,
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::AccumulateMarkup => "ACCUMULATE_MARKUP",
            Verdict::DistributionMarkdown => "DISTRIBUTION_MARKDOWN",
            Verdict::Manipulation => "MANIPULATION",
            Verdict::Neutral => "NEUTRAL",
            Verdict::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub verdict: Verdict,
    pub buy_score: f64,
    pub sell_score: f64,
    pub cvd_cumulative: f64,
    pub open_interest: Option<f64>,
    pub oi_change_pct: f64,
    pub spoof_count: usize,
    pub tracked_entry_count: usize,
}

pub struct SignalAggregator {
    cfg: Config,
}

impl SignalAggregator {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Entry weight: persistence doubles it, high impact adds 1.5x, sweeps
    /// add another 1.5x, spoofs contribute nothing.
    fn entry_score(&self, entry: &TrackedEntry) -> f64 {
        let weight = if entry.is_persistent { 2.0 } else { 1.0 };
        let impact_bonus = if entry.impact_ratio >= self.cfg.impact_ratio_threshold {
            1.5
        } else {
            1.0
        };
        let mut score = weight * impact_bonus * (entry.notional / NOTIONAL_SCALE);
        if entry.classification.is_sweep() {
            score *= 1.5;
        }
        score
    }

    pub fn aggregate(
        &self,
        entries: &[TrackedEntry],
        cvd_cumulative: f64,
        oi: Option<f64>,
        prev_oi: Option<f64>,
    ) -> AggregateResult {
        let mut buy_score = 0.0;
        let mut sell_score = 0.0;
        let mut spoof_count = 0;

        for entry in entries {
            if entry.is_spoof {
                spoof_count += 1;
                continue;
            }
            // Canceled entries are no longer resting; they count toward the
            // cycle but not toward either side's score
            if entry.canceled_at.is_some() {
                continue;
            }
            let score = self.entry_score(entry);
            match entry.side {
                Side::Bid => buy_score += score,
                Side::Ask => sell_score += score,
            }
        }

        let oi_change_pct = match (oi, prev_oi) {
            (Some(curr), Some(prev)) if prev > 0.0 => (curr - prev) / prev * 100.0,
            _ => 0.0,
        };

        let verdict = self.decide(
            entries.len(),
            buy_score,
            sell_score,
            spoof_count,
            cvd_cumulative,
            oi_change_pct,
            oi,
        );

        AggregateResult {
            verdict,
            buy_score,
            sell_score,
            cvd_cumulative,
            open_interest: oi,
            oi_change_pct,
            spoof_count,
            tracked_entry_count: entries.len(),
        }
    }

    fn decide(
        &self,
        entry_count: usize,
        buy_score: f64,
        sell_score: f64,
        spoof_count: usize,
        cvd: f64,
        oi_change_pct: f64,
        oi: Option<f64>,
    ) -> Verdict {
        // Nothing observed at all: no basis for any verdict
        if entry_count == 0 && cvd == 0.0 && oi.is_none() {
            return Verdict::Unknown;
        }
        if spoof_count >= self.cfg.manipulation_spoof_count {
            return Verdict::Manipulation;
        }

        let diff = buy_score - sell_score;
        if diff.abs() < self.cfg.score_margin {
            // Book is balanced: let the flow decide, with OI confirming
            return if cvd > 0.0 && oi_change_pct > 0.0 {
                Verdict::AccumulateMarkup
            } else if cvd < 0.0 && oi_change_pct < 0.0 {
                Verdict::DistributionMarkdown
            } else {
                Verdict::Neutral
            };
        }
        if diff >= self.cfg.score_margin {
            // Bids lead: confirmed by non-negative CVD, contradicted otherwise
            return if cvd >= 0.0 {
                Verdict::AccumulateMarkup
            } else {
                Verdict::Manipulation
            };
        }
        if cvd <= 0.0 {
            Verdict::DistributionMarkdown
        } else {
            Verdict::Manipulation
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classification;

    fn entry(side: Side, notional: f64) -> TrackedEntry {
        TrackedEntry {
            side,
            price: 100_000.0,
            qty: notional / 100_000.0,
            notional,
            created_at: 1_000,
            last_seen_at: 1_000,
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

    fn aggregator() -> SignalAggregator {
        SignalAggregator::new(Config::default())
    }

    // =========================================================================
    // Scoring
    // =========================================================================

    #[test]
    fn test_base_score_scales_with_notional() {
        let agg = aggregator();
        let result = agg.aggregate(&[entry(Side::Bid, 200_000_000.0)], 0.0, None, None);
        assert_eq!(result.buy_score, 2.0);
        assert_eq!(result.sell_score, 0.0);
    }

    #[test]
    fn test_persistence_and_impact_multipliers() {
        let agg = aggregator();
        let mut e = entry(Side::Ask, 100_000_000.0);
        e.is_persistent = true;
        e.impact_ratio = 0.3;
        let result = agg.aggregate(&[e], 0.0, None, None);
        // 2.0 (persistent) * 1.5 (impact) * 1.0 (notional/1e8)
        assert_eq!(result.sell_score, 3.0);
    }

    #[test]
    fn test_sweep_multiplier() {
        let agg = aggregator();
        let mut e = entry(Side::Bid, 100_000_000.0);
        e.classification = Classification::SweepSell;
        let result = agg.aggregate(&[e], 0.0, None, None);
        assert_eq!(result.buy_score, 1.5);
    }

    #[test]
    fn test_canceled_entry_scores_nothing_but_counts() {
        let agg = aggregator();
        let mut gone = entry(Side::Bid, 300_000_000.0);
        gone.canceled_at = Some(2_000);
        let live = entry(Side::Bid, 100_000_000.0);
        let result = agg.aggregate(&[gone, live], 0.0, None, None);
        assert_eq!(result.buy_score, 1.0);
        assert_eq!(result.tracked_entry_count, 2);
    }

    #[test]
    fn test_spoof_contributes_zero() {
        let agg = aggregator();
        let mut e = entry(Side::Bid, 500_000_000.0);
        e.is_spoof = true;
        e.classification = Classification::Spoof;
        let result = agg.aggregate(&[e], 0.0, None, None);
        assert_eq!(result.buy_score, 0.0);
        assert_eq!(result.spoof_count, 1);
    }

    // =========================================================================
    // Decision ladder
    // =========================================================================

    fn scored(buy: f64, sell: f64) -> Vec<TrackedEntry> {
        // notional of n*1e8 yields a score of n for plain entries
        vec![entry(Side::Bid, buy * 1e8), entry(Side::Ask, sell * 1e8)]
    }

    #[test]
    fn test_buy_lead_with_positive_cvd_accumulates() {
        let agg = aggregator();
        let result = agg.aggregate(&scored(10.0, 1.0), 500.0, None, None);
        assert_eq!(result.verdict, Verdict::AccumulateMarkup);
    }

    #[test]
    fn test_buy_lead_with_negative_cvd_is_manipulation() {
        let agg = aggregator();
        let result = agg.aggregate(&scored(10.0, 1.0), -500.0, None, None);
        assert_eq!(result.verdict, Verdict::Manipulation);
    }

    #[test]
    fn test_sell_lead_with_negative_cvd_distributes() {
        let agg = aggregator();
        let result = agg.aggregate(&scored(1.0, 10.0), -500.0, None, None);
        assert_eq!(result.verdict, Verdict::DistributionMarkdown);
    }

    #[test]
    fn test_sell_lead_with_positive_cvd_is_manipulation() {
        let agg = aggregator();
        let result = agg.aggregate(&scored(1.0, 10.0), 500.0, None, None);
        assert_eq!(result.verdict, Verdict::Manipulation);
    }

    #[test]
    fn test_spoof_flood_forces_manipulation() {
        let agg = aggregator();
        let mut entries = scored(10.0, 1.0);
        for _ in 0..4 {
            let mut e = entry(Side::Bid, 200_000_000.0);
            e.is_spoof = true;
            entries.push(e);
        }
        let result = agg.aggregate(&entries, 500.0, None, None);
        assert_eq!(result.verdict, Verdict::Manipulation);
        assert_eq!(result.spoof_count, 4);
    }

    #[test]
    fn test_balanced_book_falls_back_to_flow() {
        let agg = aggregator();
        // scores 1.0 vs 1.0, gap below the 2.0 margin
        let entries = scored(1.0, 1.0);
        let up = agg.aggregate(&entries, 300.0, Some(1_100.0), Some(1_000.0));
        assert_eq!(up.verdict, Verdict::AccumulateMarkup);
        let down = agg.aggregate(&entries, -300.0, Some(900.0), Some(1_000.0));
        assert_eq!(down.verdict, Verdict::DistributionMarkdown);
        let mixed = agg.aggregate(&entries, 300.0, Some(900.0), Some(1_000.0));
        assert_eq!(mixed.verdict, Verdict::Neutral);
    }

    #[test]
    fn test_no_data_is_unknown() {
        let agg = aggregator();
        let result = agg.aggregate(&[], 0.0, None, None);
        assert_eq!(result.verdict, Verdict::Unknown);
    }

    #[test]
    fn test_oi_change_pct() {
        let agg = aggregator();
        let result = agg.aggregate(&[], 100.0, Some(1_050.0), Some(1_000.0));
        assert!((result.oi_change_pct - 5.0).abs() < 1e-9);
        // Missing previous reading leaves the change at zero
        let result = agg.aggregate(&[], 100.0, Some(1_050.0), None);
        assert_eq!(result.oi_change_pct, 0.0);
    }

    #[test]
    fn test_aggregate_is_pure() {
        let agg = aggregator();
        let entries = scored(4.0, 1.0);
        let a = agg.aggregate(&entries, 250.0, Some(1_000.0), Some(950.0));
        let b = agg.aggregate(&entries, 250.0, Some(1_000.0), Some(950.0));
        assert_eq!(a, b);
    }
}
