//! Structured JSON logging.
//!
//! Line-oriented records on stdout, filterable by level (`LOG_LEVEL`) and
//! domain (`LOG_DOMAINS`, comma-separated list or "all"). One record per
//! event keeps the stream grep- and replay-friendly.

use chrono::Utc;
use serde_json::{Map, Value};

// =============================================================================
// Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// =============================================================================
// Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Feed,    // Depth/trade stream, subscriptions
    Tracker, // Entry lifecycle transitions
    Signal,  // Aggregation verdicts
    Trap,    // Trap validation
    Store,   // Persistence
    System,  // Startup, shutdown, config
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Feed => "feed",
            Domain::Tracker => "tracker",
            Domain::Signal => "signal",
            Domain::Trap => "trap",
            Domain::Store => "store",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Emission
// =============================================================================

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit an info-level record.
pub fn json_log(domain: Domain, event: &str, fields: Value) {
    json_log_at(Level::Info, domain, event, fields);
}

/// Emit a record at an explicit level.
pub fn json_log_at(level: Level, domain: Domain, event: &str, fields: Value) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    let mut record = Map::new();
    record.insert("ts".to_string(), Value::from(now_ms()));
    record.insert("level".to_string(), Value::from(level.as_str()));
    record.insert("domain".to_string(), Value::from(domain.as_str()));
    record.insert("event".to_string(), Value::from(event));
    if let Value::Object(extra) = fields {
        for (k, v) in extra {
            record.insert(k, v);
        }
    }
    println!("{}", Value::Object(record));
}

/// Build a field object from key/value pairs.
pub fn obj(fields: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    for (k, v) in fields {
        map.insert((*k).to_string(), v.clone());
    }
    Value::Object(map)
}

pub fn v_str(s: &str) -> Value {
    Value::from(s)
}

pub fn v_num(n: f64) -> Value {
    Value::from(n)
}

pub fn v_bool(b: bool) -> Value {
    Value::from(b)
}
