//! Free-form experiment state attached to measurements.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Nested key/value state, e.g. `{"temperature": {"package": 0.1}, "heater_voltage": 0.5}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub Map<String, Value>);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Follow nested maps; `None` as soon as a key is missing.
    pub fn get_path(&self, keys: &[&str]) -> Option<&Value> {
        let (first, rest) = keys.split_first()?;
        let mut value = self.0.get(*first)?;
        for key in rest {
            value = value.as_object()?.get(*key)?;
        }
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flatten nested maps into one level, joining keys with `_`.
    ///
    /// Lists stay whole as single values.
    pub fn flatten(&self, prefix: &str) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        flatten_into(&self.0, prefix, &mut out);
        out
    }
}

fn flatten_into(map: &Map<String, Value>, prefix: &str, out: &mut BTreeMap<String, Value>) {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}_{}", prefix, key)
        };
        match value {
            Value::Object(inner) => flatten_into(inner, &name, out),
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}

impl From<Map<String, Value>> for State {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested() -> State {
        match json!({
            "heater_voltage": 0.5,
            "temperature": {"package": 0.1, "load": {"primary": 4.2}},
            "atten": [10, 20]
        }) {
            Value::Object(map) => State(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_flatten_joins_keys() {
        let flat = nested().flatten("");
        assert_eq!(flat["temperature_package"], json!(0.1));
        assert_eq!(flat["temperature_load_primary"], json!(4.2));
        assert_eq!(flat["atten"], json!([10, 20]));
        assert_eq!(flat.len(), 4);
    }

    #[test]
    fn test_flatten_with_prefix() {
        let flat = nested().flatten("stream");
        assert!(flat.contains_key("stream_heater_voltage"));
        assert!(flat.contains_key("stream_temperature_load_primary"));
    }

    #[test]
    fn test_get_path() {
        let state = nested();
        assert_eq!(state.get_path(&["temperature", "package"]), Some(&json!(0.1)));
        assert!(state.get_path(&["temperature", "missing"]).is_none());
        assert!(state.get_path(&["heater_voltage", "x"]).is_none());
    }
}
