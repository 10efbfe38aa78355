use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One immutable entry observed from the log.
///
/// `key` is the entry's globally unique identifier, `timestamp` the log's
/// receive order in milliseconds (monotonic per source, not totally ordered
/// across sources in live mode). `payload` is the full raw document the
/// query stages ran against; after a map stage it holds the mapped value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub timestamp: i64,
    pub payload: Value,
}

impl Record {
    pub fn new(key: impl Into<String>, timestamp: i64, payload: Value) -> Self {
        Self {
            key: key.into(),
            timestamp,
            payload,
        }
    }

    /// Validate a raw log document. Malformed entries (missing or empty key,
    /// missing or non-finite timestamp) are dropped here so the materialized
    /// views never see them.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let key = match raw.get("key").and_then(Value::as_str) {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => {
                debug!("dropping record without key");
                return None;
            }
        };
        let timestamp = match raw.get("timestamp").and_then(finite_millis) {
            Some(ts) => ts,
            None => {
                debug!(key = %key, "dropping record without usable timestamp");
                return None;
            }
        };
        Some(Self {
            key,
            timestamp,
            payload: raw.clone(),
        })
    }

    /// Walk a field path into the payload.
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        let mut current = &self.payload;
        for segment in path {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Numeric field as milliseconds, rejecting non-finite values.
    pub fn field_millis(&self, path: &[&str]) -> Option<i64> {
        self.field(path).and_then(finite_millis)
    }
}

pub(crate) fn finite_millis(value: &Value) -> Option<i64> {
    let number = value.as_f64()?;
    if number.is_finite() {
        Some(number as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_well_formed_document() {
        let raw = json!({
            "key": "%abc",
            "timestamp": 1700000000000_i64,
            "value": { "content": { "type": "post" } }
        });
        let record = Record::from_value(&raw).unwrap();
        assert_eq!(record.key, "%abc");
        assert_eq!(record.timestamp, 1700000000000);
        assert_eq!(
            record.field(&["value", "content", "type"]),
            Some(&json!("post"))
        );
    }

    #[test]
    fn rejects_missing_or_empty_key() {
        assert!(Record::from_value(&json!({ "timestamp": 1 })).is_none());
        assert!(Record::from_value(&json!({ "key": "", "timestamp": 1 })).is_none());
    }

    #[test]
    fn rejects_non_numeric_timestamp() {
        assert!(Record::from_value(&json!({ "key": "%a", "timestamp": "soon" })).is_none());
        assert!(Record::from_value(&json!({ "key": "%a" })).is_none());
    }

    #[test]
    fn field_millis_rejects_non_numeric() {
        let record = Record::new("%a", 1, json!({ "value": { "timestamp": "x" } }));
        assert_eq!(record.field_millis(&["value", "timestamp"]), None);
    }
}
