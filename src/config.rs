use crate::error::{GResult, GeolocationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Tracking options forwarded to the native engine.
///
/// Kept as a flat JSON object: the native side owns the option schema, this layer only
/// merges and forwards. Typed accessors cover the options the plugin documents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(Map<String, Value>);

impl Config {
    pub fn new() -> Self {
        Config(Map::new())
    }

    pub fn from_json_str(json: &str) -> GResult<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(map) => Ok(Config(map)),
            other => Err(GeolocationError::invalid(
                "#configure",
                format!("config must be a JSON object, got {}", other),
            )),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> GResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            GeolocationError::invalid("#configure", format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shallow merge: top-level keys of `update` overwrite ours, nested objects are replaced whole
    pub fn merge(&mut self, update: &Config) {
        for (key, value) in &update.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn desired_accuracy(&self) -> Option<i64> {
        self.0.get("desiredAccuracy").and_then(Value::as_i64)
    }

    pub fn stationary_radius(&self) -> Option<f64> {
        self.0.get("stationaryRadius").and_then(Value::as_f64)
    }

    pub fn distance_filter(&self) -> Option<f64> {
        self.0.get("distanceFilter").and_then(Value::as_f64)
    }

    /// Seconds to wait for a location fix
    pub fn location_timeout(&self) -> Option<u64> {
        self.0.get("locationTimeout").and_then(Value::as_u64)
    }

    pub fn debug(&self) -> bool {
        self.0.get("debug").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn stop_on_terminate(&self) -> Option<bool> {
        self.0.get("stopOnTerminate").and_then(Value::as_bool)
    }

    /// HTTP endpoint the native side syncs the location queue to
    pub fn url(&self) -> Option<&str> {
        self.0.get("url").and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for Config {
    fn from(map: Map<String, Value>) -> Self {
        Config(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shallow_merge() {
        let mut current = Config::new()
            .with("distanceFilter", 50)
            .with("headers", json!({"a": 1, "b": 2}));
        let update = Config::new()
            .with("distanceFilter", 10)
            .with("headers", json!({"c": 3}))
            .with("debug", true);

        current.merge(&update);

        assert_eq!(current.distance_filter(), Some(10.0));
        assert_eq!(current.get("headers"), Some(&json!({"c": 3})));
        assert!(current.debug());
        assert_eq!(current.len(), 3);
    }

    #[test]
    fn test_from_json_str() {
        let config = Config::from_json_str(
            r#"{"desiredAccuracy": 0, "stationaryRadius": 25, "url": "http://localhost/locations"}"#,
        )
        .unwrap();
        assert_eq!(config.desired_accuracy(), Some(0));
        assert_eq!(config.stationary_radius(), Some(25.0));
        assert_eq!(config.url(), Some("http://localhost/locations"));
        assert_eq!(config.stop_on_terminate(), None);

        assert!(Config::from_json_str("[1, 2]").is_err());
        assert!(Config::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_serializes_as_flat_object() {
        let config = Config::new().with("debug", true);
        assert_eq!(serde_json::to_value(&config).unwrap(), json!({"debug": true}));
        assert_eq!(config.to_value(), json!({"debug": true}));
    }
}
