//! Per-entry intent labels.
//!
//! Classification reads only the entry's own fields, so a batch pass is
//! deterministic and idempotent: running it twice over an unchanged list
//! yields identical labels.

use serde::{Deserialize, Serialize};

use crate::book::Side;
use crate::config::Config;
use crate::tracker::TrackedEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    DefensiveBuy,
    DefensiveSell,
    SweepBuy,
    SweepSell,
    Spoof,
    Unknown,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::DefensiveBuy => "DEFENSIVE_BUY",
            Classification::DefensiveSell => "DEFENSIVE_SELL",
            Classification::SweepBuy => "SWEEP_BUY",
            Classification::SweepSell => "SWEEP_SELL",
            Classification::Spoof => "SPOOF",
            Classification::Unknown => "UNKNOWN",
        }
    }

    pub fn is_sweep(&self) -> bool {
        matches!(self, Classification::SweepBuy | Classification::SweepSell)
    }
}

pub struct OrderClassifier {
    cfg: Config,
}

impl OrderClassifier {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Label one entry.
    ///
    /// Spoof flags from the tracker always win. A high-impact entry whose
    /// observed fills reached the filled-ratio threshold was swept: a
    /// consumed bid means aggressive selling, a consumed ask aggressive
    /// buying. A persistent low-impact entry that was never substantially
    /// consumed is defending its side. Anything else has too little history.
    pub fn classify(&self, entry: &TrackedEntry) -> Classification {
        if entry.is_spoof {
            return Classification::Spoof;
        }
        let filled_ratio = entry.filled_ratio();
        if entry.impact_ratio >= self.cfg.impact_ratio_threshold
            && entry.was_consumed
            && filled_ratio >= self.cfg.filled_ratio_threshold
        {
            return match entry.side {
                Side::Bid => Classification::SweepSell,
                Side::Ask => Classification::SweepBuy,
            };
        }
        if entry.is_persistent
            && entry.impact_ratio < self.cfg.impact_ratio_threshold
            && filled_ratio < self.cfg.filled_ratio_threshold
        {
            return match entry.side {
                Side::Bid => Classification::DefensiveBuy,
                Side::Ask => Classification::DefensiveSell,
            };
        }
        Classification::Unknown
    }

    /// Relabel a batch in place.
    pub fn classify_batch<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = &'a mut TrackedEntry>,
    {
        for entry in entries {
            entry.classification = self.classify(entry);
        }
    }
}
