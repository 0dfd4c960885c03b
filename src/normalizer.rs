//! Adapts native delivery payloads into typed events before user code sees them.
//!
//! Payloads are duck-typed: the native side may send the record itself or wrap it as
//! `{location|locations: ..., taskId: ...}`. The task id is pulled out first so a
//! payload that fails to decode can still be acknowledged.

use crate::error::{GResult, GeolocationError};
use crate::types::{GeofenceAction, GeofenceEvent, Location, TaskId};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Event shapes delivered to recurring and one-shot listeners
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    Location(Location),
    Locations(Vec<Location>),
    Geofence(GeofenceEvent),
}

/// Which decoder a delivery goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Location,
    Locations,
    Geofence,
}

impl NativeEvent {
    pub fn decode(kind: PayloadKind, body: Value) -> GResult<NativeEvent> {
        match kind {
            PayloadKind::Location => decode_location(body).map(NativeEvent::Location),
            PayloadKind::Locations => decode_locations(body).map(NativeEvent::Locations),
            PayloadKind::Geofence => decode_geofence(body).map(NativeEvent::Geofence),
        }
    }
}

/// Remove and return the `taskId` of a payload, substituting the sentinel when absent
pub fn split_task(payload: Value) -> (TaskId, Value) {
    match payload {
        Value::Object(mut map) => {
            let task_id = map
                .remove("taskId")
                .and_then(task_id_from_value)
                .unwrap_or_else(TaskId::undefined);
            (task_id, Value::Object(map))
        }
        other => (TaskId::undefined(), other),
    }
}

fn task_id_from_value(value: Value) -> Option<TaskId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(TaskId::from(s)),
        // iOS background task identifiers arrive as integers; 0 is the invalid task
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Number(n) => Some(TaskId::from(n.to_string())),
        _ => None,
    }
}

/// Decode a single location, unwrapping a `location` field when present
pub fn decode_location(body: Value) -> GResult<Location> {
    match body {
        Value::Object(mut map) => match map.remove("location") {
            Some(inner @ Value::Object(_)) => location_from_value(inner),
            Some(Value::Null) | None => location_from_map(map),
            Some(other) => Err(GeolocationError::Payload(format!(
                "'location' must be an object, got {}",
                other
            ))),
        },
        other => Err(GeolocationError::Payload(format!(
            "expected a location object, got {}",
            other
        ))),
    }
}

/// Decode a `locations` list, or a bare list of records
pub fn decode_locations(body: Value) -> GResult<Vec<Location>> {
    let list = match body {
        Value::Object(mut map) => map.remove("locations").unwrap_or(Value::Null),
        other => other,
    };
    match list {
        Value::Array(records) => records.into_iter().map(location_from_value).collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(GeolocationError::Payload(format!(
            "'locations' must be a list, got {}",
            other
        ))),
    }
}

/// Decode a geofence crossing; every remaining param is kept on the event
pub fn decode_geofence(body: Value) -> GResult<GeofenceEvent> {
    let Value::Object(params) = body else {
        return Err(GeolocationError::Payload(
            "geofence event must be an object".to_string(),
        ));
    };

    let identifier = params
        .get("identifier")
        .and_then(Value::as_str)
        .ok_or_else(|| GeolocationError::Payload("geofence event without identifier".to_string()))?
        .to_string();
    let action = params
        .get("action")
        .and_then(Value::as_str)
        .map(GeofenceAction::parse)
        .ok_or_else(|| GeolocationError::Payload("geofence event without action".to_string()))?;
    let location = match params.get("location") {
        Some(value @ Value::Object(_)) => Some(location_from_value(value.clone())?),
        _ => None,
    };

    Ok(GeofenceEvent {
        identifier,
        action,
        location,
        params,
    })
}

/// Decode an optional location (`null` means none)
pub fn decode_optional_location(body: Value) -> GResult<Option<Location>> {
    match body {
        Value::Null => Ok(None),
        other => decode_location(other).map(Some),
    }
}

fn location_from_value(value: Value) -> GResult<Location> {
    match value {
        Value::Object(map) => location_from_map(map),
        other => Err(GeolocationError::Payload(format!(
            "expected a location object, got {}",
            other
        ))),
    }
}

fn location_from_map(mut fields: Map<String, Value>) -> GResult<Location> {
    let timestamp = match fields.remove("timestamp") {
        None | Some(Value::Null) => None,
        Some(raw) => match decode_timestamp(&raw) {
            Some(ts) => Some(ts),
            None => {
                log::debug!("Leaving undecodable timestamp {} as-is", raw);
                fields.insert("timestamp".to_string(), raw);
                None
            }
        },
    };
    Ok(Location { timestamp, fields })
}

/// Epoch milliseconds (integer or float) or an RFC 3339 string
pub fn decode_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Number(n) => {
            let millis = match n.as_i64() {
                Some(ms) => ms,
                // Sub-millisecond digits are dropped, not rounded
                None => n.as_f64().filter(|f| f.is_finite())?.trunc() as i64,
            };
            DateTime::from_timestamp_millis(millis)
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_task_sentinel() {
        let (task_id, body) = split_task(json!({"taskId": "t9", "location": {}}));
        assert_eq!(task_id, TaskId::from("t9"));
        assert_eq!(body, json!({"location": {}}));

        let (task_id, _) = split_task(json!({"latitude": 1.0}));
        assert!(task_id.is_undefined());

        let (task_id, _) = split_task(json!({"taskId": 42}));
        assert_eq!(task_id.as_str(), "42");

        let (task_id, _) = split_task(json!({"taskId": 0}));
        assert!(task_id.is_undefined());

        let (task_id, _) = split_task(json!({"taskId": ""}));
        assert!(task_id.is_undefined());

        let (task_id, body) = split_task(json!([1, 2]));
        assert!(task_id.is_undefined());
        assert_eq!(body, json!([1, 2]));
    }

    #[test]
    fn test_single_location_timestamp() {
        let location = decode_location(json!({
            "location": {"timestamp": 1700000000000i64, "coords": {"latitude": 1.0}}
        }))
        .unwrap();
        assert_eq!(location.timestamp.unwrap().timestamp_millis(), 1700000000000);
        assert!(location.get("timestamp").is_none());
        assert_eq!(location.latitude(), Some(1.0));

        // Bare record, no wrapper
        let location = decode_location(json!({"timestamp": "2023-11-14T22:13:20Z", "lat": 3})).unwrap();
        assert_eq!(location.timestamp.unwrap().timestamp_millis(), 1700000000000);
    }

    #[test]
    fn test_location_without_timestamp_untouched() {
        let location = decode_location(json!({"lat": 1, "speed": 3.5})).unwrap();
        assert!(location.timestamp.is_none());
        assert_eq!(location.get("speed"), Some(&json!(3.5)));
    }

    #[test]
    fn test_undecodable_timestamp_kept() {
        let location = decode_location(json!({"timestamp": "yesterday"})).unwrap();
        assert!(location.timestamp.is_none());
        assert_eq!(location.get("timestamp"), Some(&json!("yesterday")));
    }

    #[test]
    fn test_location_list_timestamps() {
        let locations = decode_locations(json!({
            "locations": [
                {"timestamp": 1700000000000i64, "lat": 1, "lng": 2},
                {"timestamp": 1700000001000.0, "lat": 1, "lng": 2},
                {"lat": 5}
            ]
        }))
        .unwrap();
        assert_eq!(locations.len(), 3);
        assert_eq!(locations[0].timestamp.unwrap().timestamp_millis(), 1700000000000);
        assert_eq!(locations[1].timestamp.unwrap().timestamp_millis(), 1700000001000);
        assert!(locations[2].timestamp.is_none());

        let location = decode_location(json!({"timestamp": 1700000000000.7})).unwrap();
        assert_eq!(location.timestamp.unwrap().timestamp_millis(), 1700000000000);

        assert!(decode_locations(json!({})).unwrap().is_empty());
        assert!(decode_locations(json!({"locations": "nope"})).is_err());
    }

    #[test]
    fn test_geofence_event() {
        let (task_id, body) = split_task(json!({
            "taskId": "g1",
            "identifier": "zoneA",
            "action": "ENTER",
            "location": {"timestamp": 1700000000000i64}
        }));
        let event = decode_geofence(body).unwrap();
        assert_eq!(task_id.as_str(), "g1");
        assert_eq!(event.identifier, "zoneA");
        assert_eq!(event.action, GeofenceAction::Enter);
        assert!(event.location.unwrap().timestamp.is_some());
        assert!(!event.params.contains_key("taskId"));

        assert!(decode_geofence(json!({"action": "EXIT"})).is_err());
        assert!(decode_geofence(json!("zoneA")).is_err());
    }

    #[test]
    fn test_native_event_decode() {
        let event = NativeEvent::decode(PayloadKind::Locations, json!({"locations": []})).unwrap();
        assert_eq!(event, NativeEvent::Locations(Vec::new()));
        assert!(decode_optional_location(Value::Null).unwrap().is_none());
    }
}
