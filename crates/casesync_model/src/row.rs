//! Flat records exchanged with the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Extracts the primary key of a row, if it has a usable one.
pub type KeyFn = fn(&Row) -> Option<String>;

/// A flat, foreign-keyed record.
///
/// Rows are loosely typed JSON objects. They are what the reconciler merges
/// and what the remote gateway reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Converts a JSON value into a row; `None` if it is not an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Sets a field.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Returns a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns a field as key text.
    ///
    /// Strings are returned as-is and numbers as their decimal text; empty
    /// strings and any other value yield `None`.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The `updated_at` timestamp in epoch milliseconds.
    ///
    /// Absent or unparseable timestamps count as the epoch.
    pub fn updated_at_millis(&self) -> i64 {
        self.0.get("updated_at").map(timestamp_millis).unwrap_or(0)
    }

    /// Rewrites a numeric key column into its text form.
    pub fn normalize_key(&mut self, field: &str) {
        if let Some(Value::Number(n)) = self.0.get(field) {
            let text = n.to_string();
            self.0.insert(field.to_string(), Value::String(text));
        }
    }

    /// Borrows the underlying object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the row, returning the underlying object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Consumes the row, returning it as a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Key extraction for tables keyed by `id`.
pub fn key_by_id(row: &Row) -> Option<String> {
    row.text("id")
}

/// Key extraction for tables keyed by `name`.
pub fn key_by_name(row: &Row) -> Option<String> {
    row.text("name")
}

/// Interprets a JSON timestamp as epoch milliseconds.
///
/// RFC 3339 strings are parsed; integers are taken as milliseconds already.
/// Anything else is the epoch.
pub fn timestamp_millis(value: &Value) -> i64 {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
            .unwrap_or(0),
        Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_text_normalizes_numbers() {
        let row = Row::new().with("id", 42);
        assert_eq!(key_by_id(&row), Some("42".to_string()));

        let row = Row::new().with("id", "");
        assert_eq!(key_by_id(&row), None);

        let row = Row::new().with("name", "Mona");
        assert_eq!(key_by_name(&row), Some("Mona".to_string()));
        assert_eq!(key_by_id(&row), None);
    }

    #[test]
    fn missing_timestamp_is_epoch() {
        assert_eq!(Row::new().updated_at_millis(), 0);
        assert_eq!(Row::new().with("updated_at", "garbage").updated_at_millis(), 0);
        assert_eq!(Row::new().with("updated_at", Value::Null).updated_at_millis(), 0);
    }

    #[test]
    fn timestamp_parsing() {
        let row = Row::new().with("updated_at", "1970-01-01T00:00:01.500Z");
        assert_eq!(row.updated_at_millis(), 1500);

        let row = Row::new().with("updated_at", "2024-03-01T10:00:00+02:00");
        assert_eq!(
            row.updated_at_millis(),
            DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
                .unwrap()
                .timestamp_millis()
        );

        assert_eq!(timestamp_millis(&json!(1234)), 1234);
    }

    #[test]
    fn normalize_key_rewrites_numbers_only() {
        let mut row = Row::new().with("id", 7).with("client_id", "c1");
        row.normalize_key("id");
        row.normalize_key("client_id");
        assert_eq!(row.get("id"), Some(&json!("7")));
        assert_eq!(row.get("client_id"), Some(&json!("c1")));
    }
}
