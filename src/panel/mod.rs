//! AMP panel API.
//!
//! [`PanelApi`] is the set of RPCs the poll-based adapter needs; [`AmpApiClient`] implements
//! it over HTTP. Console output comes back from `GetUpdates` as [`ConsoleEntry`] values, each of
//! which may hold several console lines.

mod client;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

pub use client::AmpApiClient;

use crate::errors::TransportError;

/// RPCs consumed from the panel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// Authenticate, and open the instance session when an instance is configured.
    async fn login(&self) -> Result<(), TransportError>;

    async fn logout(&self) -> Result<(), TransportError>;

    /// Console entries produced since the previous call.
    async fn get_updates(&self) -> Result<Vec<ConsoleEntry>, TransportError>;

    async fn send_console_message(&self, message: String) -> Result<bool, TransportError>;

    async fn start_instance(&self) -> Result<bool, TransportError>;

    async fn stop_instance(&self) -> Result<bool, TransportError>;

    async fn get_status(&self) -> Result<Value, TransportError>;
}

/// One entry of `GetUpdates.ConsoleEntries`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleEntry {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub kind: String,
    pub contents: String,
}

impl ConsoleEntry {
    pub fn new(timestamp: DateTime<Utc>, contents: impl Into<String>) -> Self {
        Self {
            timestamp,
            source: String::new(),
            kind: String::new(),
            contents: contents.into(),
        }
    }

    /// Parse `{Timestamp, Source, Type, Contents}`. `None` when the timestamp is unusable.
    pub fn from_value(value: &Value) -> Option<Self> {
        let timestamp = parse_timestamp(value.get("Timestamp")?)?;
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        Some(Self {
            timestamp,
            source: text("Source"),
            kind: text("Type"),
            contents: text("Contents"),
        })
    }

    /// Key identifying the entry across polls: ISO-8601 timestamp and content.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.timestamp.to_rfc3339(), self.contents)
    }

    pub fn epoch_seconds(&self) -> f64 {
        self.timestamp.timestamp_millis() as f64 / 1000.0
    }
}

/// ISO-8601 string (offset optional, `Z` accepted) or epoch number, milliseconds above 1e10.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        }
        Value::Number(number) => {
            let mut seconds = number.as_f64()?;
            if seconds > 1e10 {
                seconds /= 1000.0;
            }
            let whole = seconds.floor();
            let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
            DateTime::from_timestamp(whole as i64, nanos)
        }
        _ => None,
    }
}

#[cfg(test)]
mod panel_tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_iso_and_epoch_timestamps() {
        let iso = parse_timestamp(&json!("2024-03-01T10:00:00Z")).unwrap();
        let offset = parse_timestamp(&json!("2024-03-01T12:00:00+02:00")).unwrap();
        let naive = parse_timestamp(&json!("2024-03-01T10:00:00.000")).unwrap();
        let seconds = parse_timestamp(&json!(1_709_287_200)).unwrap();
        let millis = parse_timestamp(&json!(1_709_287_200_000_i64)).unwrap();
        assert_eq!(iso, offset);
        assert_eq!(iso, naive);
        assert_eq!(iso, seconds);
        assert_eq!(iso, millis);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn entry_from_value() {
        let entry = ConsoleEntry::from_value(&json!({
            "Timestamp": "2024-03-01T10:00:00Z",
            "Source": "Console",
            "Type": "Console",
            "Contents": "---------players--------\n#end"
        }))
        .unwrap();
        assert_eq!(entry.source, "Console");
        assert_eq!(entry.contents, "---------players--------\n#end");
        assert_eq!(
            entry.dedup_key(),
            "2024-03-01T10:00:00+00:00:---------players--------\n#end"
        );
        assert_eq!(entry.epoch_seconds(), 1_709_287_200.0);

        assert!(ConsoleEntry::from_value(&json!({"Contents": "no timestamp"})).is_none());
    }
}
