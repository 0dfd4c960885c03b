use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Task id substituted when a native delivery carries none
pub const UNDEFINED_TASK_ID: &str = "task-id-undefined";

/// Opaque background-task identifier minted by the native side per delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    pub fn undefined() -> Self {
        TaskId(UNDEFINED_TASK_ID.to_string())
    }

    pub fn is_undefined(&self) -> bool {
        self.0 == UNDEFINED_TASK_ID
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        TaskId(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        TaskId(id)
    }
}

/// Terminal acknowledgment reported to the native side for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Finished,
    Failed(String),
}

/// Location record delivered by the native engine.
///
/// Only the timestamp is decoded; every other field is carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Location {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Latitude from `coords.latitude`, falling back to a flat `latitude` or `lat` field
    pub fn latitude(&self) -> Option<f64> {
        self.coordinate(&["latitude", "lat"])
    }

    /// Longitude from `coords.longitude`, falling back to a flat `longitude`, `lng` or `lon` field
    pub fn longitude(&self) -> Option<f64> {
        self.coordinate(&["longitude", "lng", "lon"])
    }

    /// Radius of a stationary region, when the record describes one
    pub fn radius(&self) -> Option<f64> {
        self.fields.get("radius").and_then(Value::as_f64)
    }

    fn coordinate(&self, keys: &[&str]) -> Option<f64> {
        let coords = self.fields.get("coords").and_then(Value::as_object);
        keys.iter().find_map(|key| {
            coords
                .and_then(|c| c.get(*key))
                .or_else(|| self.fields.get(*key))
                .and_then(Value::as_f64)
        })
    }
}

/// Circular region monitored by the native geofencing engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    #[serde(default)]
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_enter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_exit: Option<bool>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Geofence {
    pub fn new(identifier: impl Into<String>) -> Self {
        Geofence {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    pub fn center(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn radius(mut self, radius: f64) -> Self {
        self.radius = Some(radius);
        self
    }

    pub fn notify_on_enter(mut self, notify: bool) -> Self {
        self.notify_on_enter = Some(notify);
        self
    }

    pub fn notify_on_exit(mut self, notify: bool) -> Self {
        self.notify_on_exit = Some(notify);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// Transition reported for a geofence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeofenceAction {
    Enter,
    Exit,
    Other(String),
}

impl GeofenceAction {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "ENTER" => GeofenceAction::Enter,
            "EXIT" => GeofenceAction::Exit,
            _ => GeofenceAction::Other(raw.to_string()),
        }
    }
}

/// Geofence crossing delivered to `onGeofence` listeners
#[derive(Debug, Clone, PartialEq)]
pub struct GeofenceEvent {
    pub identifier: String,
    pub action: GeofenceAction,
    pub location: Option<Location>,
    /// Remaining params of the delivery, task id removed
    pub params: Map<String, Value>,
}
