//! Opaque Event Payload
//!
//! Payloads are JSON objects produced by capture agents. The pipeline never
//! promotes them to a closed type: the set of event types is extensible by
//! design, so payloads stay an opaque key-value map with typed accessors at
//! the points that need specific fields (the builder code paths).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An opaque structured payload carried by every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Parse from a serialized JSON object.
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let map: Map<String, Value> = serde_json::from_str(raw)?;
        Ok(Self(map))
    }

    pub fn to_json(&self) -> String {
        // A Map of Values always serializes.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Size of the serialized form, used for the inline-vs-reference CDC cut.
    pub fn serialized_len(&self) -> usize {
        self.to_json().len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert, convenient for tests and synthetic events.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
