//! Relational persistence sink.
//!
//! Detection records are telemetry, not a ledger: writers log-and-continue on
//! failure, and losing a single record is acceptable. The `detector_config`
//! table is the key/value store the orchestrator overlays onto built-in
//! defaults at startup.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::logging::{json_log_at, obj, v_str, Domain, Level};
use crate::record::{DetectionPayload, DetectionRecord};

pub struct DetectionStore {
    conn: Connection,
}

/// A detection row as read back for the history roll-up.
#[derive(Debug, Clone)]
pub struct StoredDetection {
    pub symbol: String,
    pub ts_ms: u64,
    pub verdict: String,
    pub payload: DetectionPayload,
}

impl DetectionStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    /// Ephemeral store, used by tests and ad-hoc tooling.
    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                verdict TEXT NOT NULL,
                buy_score REAL NOT NULL,
                sell_score REAL NOT NULL,
                cvd_cum REAL NOT NULL,
                open_interest REAL,
                oi_change_pct REAL NOT NULL,
                spoof_count INTEGER NOT NULL,
                tracked_entries INTEGER NOT NULL,
                trap_type TEXT,
                trap_confidence REAL,
                detection_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_detections_symbol_ts
                ON detections (symbol, ts);
            CREATE TABLE IF NOT EXISTS detector_config (
                config_key TEXT PRIMARY KEY,
                config_value TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn insert_detection(&mut self, record: &DetectionRecord) -> Result<()> {
        let (trap_type, trap_confidence) = match &record.payload.trap {
            Some(t) if t.detected => (Some(t.trap_type.as_str()), Some(t.confidence)),
            _ => (None, None),
        };
        self.conn.execute(
            "INSERT INTO detections
             (symbol, ts, verdict, buy_score, sell_score, cvd_cum, open_interest,
              oi_change_pct, spoof_count, tracked_entries, trap_type, trap_confidence,
              detection_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.symbol,
                record.ts_ms as i64,
                record.verdict.as_str(),
                record.buy_score,
                record.sell_score,
                record.cvd_cumulative,
                record.open_interest,
                record.oi_change_pct,
                record.spoof_count as i64,
                record.tracked_entry_count as i64,
                trap_type,
                trap_confidence,
                record.payload.to_json()?,
            ],
        )?;
        Ok(())
    }

    /// Config key/value rows, empty when the table has none.
    pub fn load_config_overrides(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT config_key, config_value FROM detector_config")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO detector_config (config_key, config_value) VALUES (?1, ?2)
             ON CONFLICT(config_key) DO UPDATE SET config_value = excluded.config_value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Detection rows for one symbol since a timestamp, oldest first. Rows
    /// whose payload no longer parses are skipped with a warning rather than
    /// failing the whole query.
    pub fn recent_detections(&self, symbol: &str, since_ms: u64) -> Result<Vec<StoredDetection>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, ts, verdict, detection_data FROM detections
             WHERE symbol = ?1 AND ts >= ?2 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![symbol, since_ms as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, ts, verdict, raw) = row?;
            match DetectionPayload::from_json(&raw) {
                Ok(payload) => out.push(StoredDetection {
                    symbol,
                    ts_ms: ts as u64,
                    verdict,
                    payload,
                }),
                Err(err) => {
                    json_log_at(
                        Level::Warn,
                        Domain::Store,
                        "detection_payload_unreadable",
                        obj(&[("symbol", v_str(&symbol)), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }
        Ok(out)
    }

    /// Most recent detection timestamp for a symbol, if any.
    pub fn last_detection_ts(&self, symbol: &str) -> Result<Option<u64>> {
        let ts: Option<i64> = self
            .conn
            .query_row(
                "SELECT ts FROM detections WHERE symbol = ?1 ORDER BY ts DESC LIMIT 1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.map(|t| t as u64))
    }
}
