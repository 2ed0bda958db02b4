//! The persisted detection contract.
//!
//! One `DetectionRecord` per detect cycle. Scalar fields land in their own
//! columns; the entry snapshots, trap summary and any extension-detector
//! fields travel in a versioned JSON payload whose schema only ever grows.
//! This payload is the single contract the query layer and the history
//! roll-up depend on.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aggregator::AggregateResult;
use crate::book::Side;
use crate::classifier::Classification;
use crate::tracker::TrackedEntry;
use crate::trap::{TrapIndicators, TrapResult, TrapType};

pub const DETECTION_PAYLOAD_VERSION: u32 = 1;

/// Point-in-time snapshot of one tracked entry, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub notional: f64,
    pub impact_ratio: f64,
    pub classification: Classification,
    pub is_persistent: bool,
    pub is_spoof: bool,
    pub was_consumed: bool,
    pub created_at: u64,
    pub last_seen_at: u64,
}

impl From<&TrackedEntry> for EntrySnapshot {
    fn from(e: &TrackedEntry) -> Self {
        Self {
            side: e.side,
            price: e.price,
            qty: e.qty,
            notional: e.notional,
            impact_ratio: e.impact_ratio,
            classification: e.classification,
            is_persistent: e.is_persistent,
            is_spoof: e.is_spoof,
            was_consumed: e.was_consumed,
            created_at: e.created_at,
            last_seen_at: e.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapSummary {
    pub detected: bool,
    pub trap_type: TrapType,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<TrapIndicators>,
}

impl From<&TrapResult> for TrapSummary {
    fn from(r: &TrapResult) -> Self {
        Self {
            detected: r.detected,
            trap_type: r.trap_type,
            confidence: r.confidence,
            indicators: r.indicators,
        }
    }
}

/// The serialized column. Deserialization tolerates unknown fields so newer
/// writers stay readable by older code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub version: u32,
    pub entries: Vec<EntrySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trap: Option<TrapSummary>,
    /// Fields from any other plugged-in detector.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl DetectionPayload {
    pub fn new(entries: Vec<EntrySnapshot>) -> Self {
        Self { version: DETECTION_PAYLOAD_VERSION, entries, trap: None, extensions: Map::new() }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// One full detection cycle result, scalar columns plus payload.
#[derive(Debug, Clone)]
pub struct DetectionRecord {
    pub symbol: String,
    pub ts_ms: u64,
    pub verdict: crate::aggregator::Verdict,
    pub buy_score: f64,
    pub sell_score: f64,
    pub cvd_cumulative: f64,
    pub open_interest: Option<f64>,
    pub oi_change_pct: f64,
    pub spoof_count: usize,
    pub tracked_entry_count: usize,
    pub payload: DetectionPayload,
}

impl DetectionRecord {
    pub fn from_cycle(
        symbol: &str,
        ts_ms: u64,
        aggregate: &AggregateResult,
        entries: &[TrackedEntry],
        trap: Option<&TrapResult>,
    ) -> Self {
        let mut payload = DetectionPayload::new(entries.iter().map(EntrySnapshot::from).collect());
        payload.trap = trap.map(TrapSummary::from);
        Self {
            symbol: symbol.to_string(),
            ts_ms,
            verdict: aggregate.verdict,
            buy_score: aggregate.buy_score,
            sell_score: aggregate.sell_score,
            cvd_cumulative: aggregate.cvd_cumulative,
            open_interest: aggregate.open_interest,
            oi_change_pct: aggregate.oi_change_pct,
            spoof_count: aggregate.spoof_count,
            tracked_entry_count: aggregate.tracked_entry_count,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> EntrySnapshot {
        EntrySnapshot {
            side: Side::Bid,
            price: 100_000.0,
            qty: 2_000.0,
            notional: 200_000_000.0,
            impact_ratio: 0.3,
            classification: Classification::DefensiveBuy,
            is_persistent: true,
            is_spoof: false,
            was_consumed: false,
            created_at: 1_000,
            last_seen_at: 5_000,
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let mut payload = DetectionPayload::new(vec![snapshot()]);
        payload.trap = Some(TrapSummary {
            detected: true,
            trap_type: TrapType::BullTrap,
            confidence: 0.7,
            indicators: None,
        });
        let json = payload.to_json().unwrap();
        let back = DetectionPayload::from_json(&json).unwrap();
        assert_eq!(back.version, DETECTION_PAYLOAD_VERSION);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].classification, Classification::DefensiveBuy);
        assert_eq!(back.trap.unwrap().trap_type, TrapType::BullTrap);
    }

    #[test]
    fn test_payload_tolerates_unknown_fields() {
        // A future writer adds a field this version has never heard of
        let json = r#"{"version":2,"entries":[],"future_field":{"x":1},"extensions":{"swan_level":"HIGH"}}"#;
        let payload = DetectionPayload::from_json(json).unwrap();
        assert_eq!(payload.version, 2);
        assert_eq!(payload.extensions["swan_level"], "HIGH");
    }

    #[test]
    fn test_payload_optional_sections_absent_when_empty() {
        let payload = DetectionPayload::new(vec![]);
        let json = payload.to_json().unwrap();
        assert!(!json.contains("trap"));
        assert!(!json.contains("extensions"));
    }

    #[test]
    fn test_entry_snapshot_serializes_stable_labels() {
        let json = serde_json::to_string(&snapshot()).unwrap();
        assert!(json.contains("\"side\":\"bid\""));
        assert!(json.contains("\"classification\":\"DEFENSIVE_BUY\""));
    }
}
