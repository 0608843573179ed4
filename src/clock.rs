//! Time source shared by the engine.
//!
//! Timestamps are Unix epoch milliseconds (`i64`). Records on the wire carry
//! RFC 3339 strings; both forms are accepted when reading.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Returns "now" in epoch milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || now.load(Ordering::SeqCst))
    }
}

/// Format epoch millis as an RFC 3339 string (millisecond precision, `Z`).
pub fn to_rfc3339(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Read a timestamp field value: RFC 3339 string or integer millis.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_round_trip() {
        let ms = 1_700_000_000_123;
        let s = to_rfc3339(ms);
        assert_eq!(s, "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_timestamp(&Value::String(s)), Some(ms));
    }

    #[test]
    fn test_parse_numeric_and_garbage() {
        assert_eq!(parse_timestamp(&serde_json::json!(42)), Some(42));
        assert_eq!(parse_timestamp(&serde_json::json!("yesterday")), None);
        assert_eq!(parse_timestamp(&Value::Null), None);
    }

    #[test]
    fn test_manual_clock() {
        let manual = ManualClock::new(1_000);
        let clock = manual.clock();
        manual.advance(500);
        assert_eq!(clock(), 1_500);
        manual.set(10);
        assert_eq!(clock(), 10);
    }
}
