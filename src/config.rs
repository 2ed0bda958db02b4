//! Tunable configuration.
//!
//! Three layers, later wins: built-in defaults, environment variables, and
//! key/value rows from the `detector_config` table. A failed config load
//! never aborts startup: monitoring runs on whatever layer resolved last.

use crate::logging::{json_log_at, obj, v_str, Domain, Level};

#[derive(Debug, Clone)]
pub struct Config {
    /// Instruments to monitor.
    pub symbols: Vec<String>,
    pub sqlite_path: String,
    pub ws_base: String,
    pub fapi_base: String,

    /// Minimum resting notional (quote units) for an order to be tracked.
    pub notional_threshold: f64,
    /// Consecutive snapshots before an entry counts as persistent.
    pub persist_snapshots: u32,
    /// Lifespan below which a canceled, non-persistent entry is a spoof.
    pub spoof_window_ms: u64,
    pub impact_ratio_threshold: f64,
    pub cvd_window_ms: u64,
    /// Relative price tolerance when matching trade prints to entries.
    pub price_tolerance: f64,
    pub max_tracked_entries: usize,
    /// Depth levels per side used for impact-ratio denominators.
    pub top_depth_levels: usize,
    /// How long canceled entries are retained before pruning.
    pub retention_ms: u64,

    pub flow_refresh_secs: u64,
    pub detect_interval_secs: u64,
    pub cvd_kline_interval: String,
    pub cvd_kline_limit: u32,
    pub price_history_len: usize,
    pub oi_history_len: usize,

    /// Score gap below which the verdict falls back to CVD/OI.
    pub score_margin: f64,
    /// Spoofs per cycle that force a manipulation verdict.
    pub manipulation_spoof_count: usize,

    pub flash_threshold_ms: u64,
    pub persistence_threshold_ms: u64,
    pub filled_ratio_threshold: f64,
    pub cancel_ratio_threshold: f64,
    pub min_trap_confidence: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            sqlite_path: "./whalewatch.sqlite".to_string(),
            ws_base: "wss://fstream.binance.com".to_string(),
            fapi_base: "https://fapi.binance.com".to_string(),
            notional_threshold: 100_000_000.0,
            persist_snapshots: 3,
            spoof_window_ms: 3_000,
            impact_ratio_threshold: 0.25,
            cvd_window_ms: 14_400_000,
            price_tolerance: 0.0005,
            max_tracked_entries: 100,
            top_depth_levels: 50,
            retention_ms: 3_600_000,
            flow_refresh_secs: 15,
            detect_interval_secs: 3_600,
            cvd_kline_interval: "15m".to_string(),
            cvd_kline_limit: 4,
            price_history_len: 240,
            oi_history_len: 64,
            score_margin: 2.0,
            manipulation_spoof_count: 3,
            flash_threshold_ms: 3_000,
            persistence_threshold_ms: 10_000,
            filled_ratio_threshold: 0.30,
            cancel_ratio_threshold: 0.80,
            min_trap_confidence: 0.60,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            symbols: std::env::var("SYMBOLS")
                .map(|v| v.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect())
                .unwrap_or(d.symbols),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            ws_base: std::env::var("WS_BASE").unwrap_or(d.ws_base),
            fapi_base: std::env::var("FAPI_BASE").unwrap_or(d.fapi_base),
            notional_threshold: env_parse("LARGE_NOTIONAL_THRESHOLD", d.notional_threshold),
            persist_snapshots: env_parse("PERSIST_SNAPSHOTS", d.persist_snapshots),
            spoof_window_ms: env_parse("SPOOF_WINDOW_MS", d.spoof_window_ms),
            impact_ratio_threshold: env_parse("IMPACT_RATIO_THRESHOLD", d.impact_ratio_threshold),
            cvd_window_ms: env_parse("CVD_WINDOW_MS", d.cvd_window_ms),
            price_tolerance: env_parse("PRICE_TOLERANCE", d.price_tolerance),
            max_tracked_entries: env_parse("MAX_TRACKED_ENTRIES", d.max_tracked_entries),
            top_depth_levels: env_parse("TOP_DEPTH_LEVELS", d.top_depth_levels),
            retention_ms: env_parse("RETENTION_MS", d.retention_ms),
            flow_refresh_secs: env_parse("FLOW_REFRESH_SECS", d.flow_refresh_secs),
            detect_interval_secs: env_parse("DETECT_INTERVAL_SECS", d.detect_interval_secs),
            cvd_kline_interval: std::env::var("CVD_KLINE_INTERVAL").unwrap_or(d.cvd_kline_interval),
            cvd_kline_limit: env_parse("CVD_KLINE_LIMIT", d.cvd_kline_limit),
            price_history_len: env_parse("PRICE_HISTORY_LEN", d.price_history_len),
            oi_history_len: env_parse("OI_HISTORY_LEN", d.oi_history_len),
            score_margin: env_parse("SCORE_MARGIN", d.score_margin),
            manipulation_spoof_count: env_parse("MANIPULATION_SPOOF_COUNT", d.manipulation_spoof_count),
            flash_threshold_ms: env_parse("FLASH_THRESHOLD_MS", d.flash_threshold_ms),
            persistence_threshold_ms: env_parse("PERSISTENCE_THRESHOLD_MS", d.persistence_threshold_ms),
            filled_ratio_threshold: env_parse("FILLED_RATIO_THRESHOLD", d.filled_ratio_threshold),
            cancel_ratio_threshold: env_parse("CANCEL_RATIO_THRESHOLD", d.cancel_ratio_threshold),
            min_trap_confidence: env_parse("MIN_TRAP_CONFIDENCE", d.min_trap_confidence),
        }
    }

    /// Overlay rows from the key/value config store. Unknown keys and
    /// unparseable values are logged and skipped, never fatal.
    pub fn apply_overrides(&mut self, rows: &[(String, String)]) {
        for (key, value) in rows {
            let applied = match key.as_str() {
                "LARGE_NOTIONAL_THRESHOLD" => set(&mut self.notional_threshold, value),
                "PERSIST_SNAPSHOTS" => set(&mut self.persist_snapshots, value),
                "SPOOF_WINDOW_MS" => set(&mut self.spoof_window_ms, value),
                "IMPACT_RATIO_THRESHOLD" => set(&mut self.impact_ratio_threshold, value),
                "CVD_WINDOW_MS" => set(&mut self.cvd_window_ms, value),
                "PRICE_TOLERANCE" => set(&mut self.price_tolerance, value),
                "MAX_TRACKED_ENTRIES" => set(&mut self.max_tracked_entries, value),
                "TOP_DEPTH_LEVELS" => set(&mut self.top_depth_levels, value),
                "RETENTION_MS" => set(&mut self.retention_ms, value),
                "FLOW_REFRESH_SECS" => set(&mut self.flow_refresh_secs, value),
                "DETECT_INTERVAL_SECS" => set(&mut self.detect_interval_secs, value),
                "SCORE_MARGIN" => set(&mut self.score_margin, value),
                "MANIPULATION_SPOOF_COUNT" => set(&mut self.manipulation_spoof_count, value),
                "FLASH_THRESHOLD_MS" => set(&mut self.flash_threshold_ms, value),
                "PERSISTENCE_THRESHOLD_MS" => set(&mut self.persistence_threshold_ms, value),
                "FILLED_RATIO_THRESHOLD" => set(&mut self.filled_ratio_threshold, value),
                "CANCEL_RATIO_THRESHOLD" => set(&mut self.cancel_ratio_threshold, value),
                "MIN_TRAP_CONFIDENCE" => set(&mut self.min_trap_confidence, value),
                _ => {
                    json_log_at(
                        Level::Warn,
                        Domain::System,
                        "config_unknown_key",
                        obj(&[("key", v_str(key))]),
                    );
                    true
                }
            };
            if !applied {
                json_log_at(
                    Level::Warn,
                    Domain::System,
                    "config_bad_value",
                    obj(&[("key", v_str(key)), ("value", v_str(value))]),
                );
            }
        }
    }
}

fn set<T: std::str::FromStr>(target: &mut T, value: &str) -> bool {
    match value.parse() {
        Ok(v) => {
            *target = v;
            true
        }
        Err(_) => false,
    }
}
