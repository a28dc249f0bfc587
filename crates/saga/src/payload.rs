//! Accumulated saga context and per-step patches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SagaError;

/// A JSON object carried between saga steps.
///
/// Steps never mutate the payload they are handed. Each returns a patch
/// (also a `Payload`) that the orchestrator merges into the accumulating
/// context with [`Payload::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

/// A field overwritten with a different value during a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// The top-level key that was overwritten.
    pub key: String,
    /// Value before the merge.
    pub previous: Value,
    /// Value after the merge.
    pub current: Value,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sets `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns true if the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of top-level fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the underlying JSON map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into a JSON object value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Applies `patch` on top of this payload, last writer wins.
    ///
    /// Merging is shallow: a patch key replaces the whole top-level value.
    /// Every key whose value actually changed is reported so callers can
    /// record it.
    pub fn merge(&mut self, patch: Payload) -> Vec<FieldConflict> {
        let mut conflicts = Vec::new();
        for (key, value) in patch.0 {
            match self.0.get(&key) {
                Some(previous) if *previous != value => {
                    conflicts.push(FieldConflict {
                        key: key.clone(),
                        previous: previous.clone(),
                        current: value.clone(),
                    });
                }
                _ => {}
            }
            self.0.insert(key, value);
        }
        conflicts
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Payload {
    type Error = SagaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(SagaError::InvalidPayload(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        payload.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        Payload::try_from(value).unwrap()
    }

    #[test]
    fn merge_adds_new_fields_without_conflicts() {
        let mut base = payload(json!({"order_id": "o-1"}));
        let conflicts = base.merge(payload(json!({"reservation_id": "r-1"})));

        assert!(conflicts.is_empty());
        assert_eq!(base.get("order_id"), Some(&json!("o-1")));
        assert_eq!(base.get("reservation_id"), Some(&json!("r-1")));
    }

    #[test]
    fn merge_last_writer_wins_and_reports_conflict() {
        let mut base = payload(json!({"status": "reserved", "amount": 10}));
        let conflicts = base.merge(payload(json!({"status": "charged", "amount": 10})));

        assert_eq!(base.get("status"), Some(&json!("charged")));
        assert_eq!(
            conflicts,
            vec![FieldConflict {
                key: "status".to_string(),
                previous: json!("reserved"),
                current: json!("charged"),
            }]
        );
    }

    #[test]
    fn merge_is_shallow() {
        let mut base = payload(json!({"shipping": {"carrier": "ups", "eta": 3}}));
        base.merge(payload(json!({"shipping": {"carrier": "dhl"}})));
        assert_eq!(base.get("shipping"), Some(&json!({"carrier": "dhl"})));
    }

    #[test]
    fn non_object_values_are_rejected() {
        assert!(Payload::try_from(json!([1, 2])).is_err());
        assert!(Payload::try_from(json!("text")).is_err());
        assert!(Payload::try_from(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn builder_inserts_fields() {
        let p = Payload::new().with("a", 1).with("b", "two");
        assert_eq!(p.len(), 2);
        assert_eq!(p.into_value(), json!({"a": 1, "b": "two"}));
    }
}
