use crate::bridge::{Action, BridgeCall, BridgeCallbacks, NativeBridge, ResultCallback};
use crate::config::Config;
use crate::error::{GResult, GeolocationError};
use crate::normalizer;
use crate::task_runner::{BackgroundTask, BackgroundTaskRunner, TaskAcknowledger};
use crate::types::{Geofence, GeofenceEvent, Location, TaskId};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handler for deliveries that open a background task
pub type TaskHandler<T> = Box<dyn Fn(T, BackgroundTask) -> anyhow::Result<()> + Send + Sync>;
pub type LocationHandler = TaskHandler<Location>;
pub type LocationsHandler = TaskHandler<Vec<Location>>;
pub type GeofenceHandler = TaskHandler<GeofenceEvent>;

pub type SuccessCallback<T> = Box<dyn Fn(T) + Send + Sync>;
/// Receives the native failure payload verbatim
pub type FailureCallback = Box<dyn Fn(Value) + Send + Sync>;

/// State owned by one client session
#[derive(Debug, Default)]
struct SessionState {
    config: Config,
    stationary_location: Option<Location>,
}

/// Client session for the native background geolocation plugin.
///
/// Every operation validates locally, then forwards to the native collaborator. Task
/// deliveries (locations, stationary entries, geofence crossings, sync results) run
/// through a [`BackgroundTaskRunner`] so each one ends in a `finish` or `error`.
pub struct BackgroundGeolocation {
    bridge: Arc<dyn NativeBridge>,
    ack: TaskAcknowledger,
    runner: BackgroundTaskRunner,
    state: Arc<Mutex<SessionState>>,
}

impl BackgroundGeolocation {
    pub fn new(bridge: Arc<dyn NativeBridge>) -> Self {
        let ack = TaskAcknowledger::new(Arc::clone(&bridge));
        BackgroundGeolocation {
            bridge,
            runner: BackgroundTaskRunner::new(ack.clone()),
            ack,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> GResult<Config> {
        Ok(self.lock_state()?.config.clone())
    }

    /// Last location delivered to `on_stationary`, if any
    pub fn stationary_location(&self) -> GResult<Option<Location>> {
        Ok(self.lock_state()?.stationary_location.clone())
    }

    pub fn configure(
        &self,
        config: Config,
        on_location: Option<LocationHandler>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.lock_state()?.config = config.clone();
        let handler = on_location.unwrap_or_else(finish_by_default);
        let on_success = task_dispatcher(self.runner.clone(), normalizer::decode_location, handler);
        self.exec(
            Action::Configure,
            vec![config.to_value()],
            BridgeCallbacks::new(on_success, failure_or_noop(on_failure)),
        )
    }

    pub fn start(
        &self,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.exec(Action::Start, vec![], passthrough(on_success, on_failure))
    }

    pub fn stop(
        &self,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.exec(Action::Stop, vec![], passthrough(on_success, on_failure))
    }

    pub fn finish(&self, task_id: &TaskId) -> GResult<()> {
        self.ack.finish(task_id)
    }

    pub fn finish_with(
        &self,
        task_id: &TaskId,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.ack
            .finish_with(task_id, passthrough(on_success, on_failure))
    }

    pub fn error(&self, task_id: &TaskId, message: &str) -> GResult<()> {
        self.ack.error(task_id, message)
    }

    /// Handle for acknowledging a task id received elsewhere
    pub fn task(&self, task_id: TaskId) -> BackgroundTask {
        self.runner.task(task_id)
    }

    /// Force the native engine into moving or stationary mode
    pub fn change_pace(
        &self,
        is_moving: bool,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.exec(
            Action::OnPaceChange,
            vec![json!(is_moving)],
            passthrough(on_success, on_failure),
        )
    }

    /// Merge `update` into the local config, then forward only the update
    pub fn set_config(
        &self,
        update: Config,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.lock_state()?.config.merge(&update);
        self.exec(
            Action::SetConfig,
            vec![update.to_value()],
            passthrough(on_success, on_failure),
        )
    }

    pub fn get_stationary_location(
        &self,
        on_success: SuccessCallback<Option<Location>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.exec(
            Action::GetStationaryLocation,
            vec![],
            typed(on_success, on_failure, normalizer::decode_optional_location),
        )
    }

    /// Listen for stationary-mode entries; the location carries the region radius
    pub fn on_stationary(
        &self,
        handler: Option<LocationHandler>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        let user = handler.unwrap_or_else(finish_by_default);
        let state = Arc::clone(&self.state);
        let caching: LocationHandler = Box::new(move |location, task| {
            state
                .lock()
                .map_err(|_| GeolocationError::Internal("Failed to acquire session lock".to_string()))?
                .stationary_location = Some(location.clone());
            user(location, task)
        });
        let on_success = task_dispatcher(self.runner.clone(), normalizer::decode_location, caching);
        self.exec(
            Action::AddStationaryRegionListener,
            vec![],
            BridgeCallbacks::new(on_success, failure_or_noop(on_failure)),
        )
    }

    /// Fetch the persisted location queue
    pub fn get_locations(
        &self,
        handler: LocationsHandler,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        let on_success = task_dispatcher(self.runner.clone(), normalizer::decode_locations, handler);
        self.exec(
            Action::GetLocations,
            vec![],
            BridgeCallbacks::new(on_success, failure_or_noop(on_failure)),
        )
    }

    /// Ask the native side to post its location queue over HTTP
    pub fn sync(&self, handler: LocationsHandler, on_failure: Option<FailureCallback>) -> GResult<()> {
        let on_success = task_dispatcher(self.runner.clone(), normalizer::decode_locations, handler);
        self.exec(
            Action::Sync,
            vec![],
            BridgeCallbacks::new(on_success, failure_or_noop(on_failure)),
        )
    }

    /// Distance travelled in metres
    pub fn get_odometer(
        &self,
        on_success: SuccessCallback<f64>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.exec(
            Action::GetOdometer,
            vec![],
            typed(on_success, on_failure, decode_odometer),
        )
    }

    pub fn reset_odometer(
        &self,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.exec(Action::ResetOdometer, vec![], passthrough(on_success, on_failure))
    }

    pub fn add_geofence(
        &self,
        geofence: Geofence,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        validate_geofence(&geofence)?;
        let args = vec![serde_json::to_value(&geofence)?];
        self.exec(Action::AddGeofence, args, passthrough(on_success, on_failure))
    }

    pub fn remove_geofence(
        &self,
        identifier: &str,
        on_success: Option<SuccessCallback<Value>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        if identifier.is_empty() {
            return Err(GeolocationError::missing("#removeGeofence", "an 'identifier'"));
        }
        self.exec(
            Action::RemoveGeofence,
            vec![json!(identifier)],
            passthrough(on_success, on_failure),
        )
    }

    pub fn on_geofence(
        &self,
        handler: GeofenceHandler,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        let on_success = task_dispatcher(self.runner.clone(), normalizer::decode_geofence, handler);
        self.exec(
            Action::OnGeofence,
            vec![],
            BridgeCallbacks::new(on_success, failure_or_noop(on_failure)),
        )
    }

    /// Fetch every geofence the native side is monitoring
    pub fn get_geofences(
        &self,
        on_success: SuccessCallback<Vec<Geofence>>,
        on_failure: Option<FailureCallback>,
    ) -> GResult<()> {
        self.exec(
            Action::GetGeofences,
            vec![],
            typed(on_success, on_failure, |value| {
                Ok(serde_json::from_value::<Vec<Geofence>>(value)?)
            }),
        )
    }

    /// Play a platform system sound (debugging aid)
    pub fn play_sound(&self, sound_id: i32) -> GResult<()> {
        self.exec(
            Action::PlaySound,
            vec![json!(sound_id)],
            BridgeCallbacks::noop(),
        )
    }

    fn exec(&self, action: Action, args: Vec<Value>, callbacks: BridgeCallbacks) -> GResult<()> {
        log::debug!("exec {} {:?}", action.as_str(), args);
        self.bridge.exec(BridgeCall::new(action, args, callbacks))
    }

    fn lock_state(&self) -> GResult<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| GeolocationError::Internal("Failed to acquire session lock".to_string()))
    }
}

/// Required fields: identifier, a finite centre, a positive radius and at least one notify flag
pub fn validate_geofence(geofence: &Geofence) -> GResult<()> {
    const OP: &str = "#addGeofence";

    if geofence.identifier.is_empty() {
        return Err(GeolocationError::missing(OP, "an 'identifier'"));
    }
    let (Some(latitude), Some(longitude)) = (geofence.latitude, geofence.longitude) else {
        return Err(GeolocationError::missing(OP, "a #latitude and #longitude"));
    };
    if !(latitude.is_finite() && (-90.0..=90.0).contains(&latitude)) {
        return Err(GeolocationError::invalid(OP, format!("latitude out of range: {}", latitude)));
    }
    if !(longitude.is_finite() && (-180.0..=180.0).contains(&longitude)) {
        return Err(GeolocationError::invalid(OP, format!("longitude out of range: {}", longitude)));
    }
    match geofence.radius {
        None => return Err(GeolocationError::missing(OP, "a #radius")),
        Some(r) if !(r.is_finite() && r > 0.0) => {
            return Err(GeolocationError::invalid(OP, format!("radius must be positive: {}", r)));
        }
        Some(_) => {}
    }
    if geofence.notify_on_enter.is_none() && geofence.notify_on_exit.is_none() {
        return Err(GeolocationError::missing(
            OP,
            "at least notifyOnEnter {Boolean} and/or #notifyOnExit {Boolean}",
        ));
    }
    Ok(())
}

fn decode_odometer(value: Value) -> GResult<f64> {
    value
        .as_f64()
        .or_else(|| value.get("distance").and_then(Value::as_f64))
        .ok_or_else(|| GeolocationError::Payload(format!("odometer is not a number: {}", value)))
}

fn finish_by_default<T: 'static>() -> TaskHandler<T> {
    Box::new(|_, task| {
        task.finish()?;
        Ok(())
    })
}

/// Split the task id off each delivery and run the handler under the task runner.
/// Decoding happens inside the runner so a malformed payload still fails its task.
fn task_dispatcher<T: 'static>(
    runner: BackgroundTaskRunner,
    decode: fn(Value) -> GResult<T>,
    handler: TaskHandler<T>,
) -> ResultCallback {
    Box::new(move |payload| {
        let (task_id, body) = normalizer::split_task(payload);
        let task = runner.task(task_id.clone());
        runner.run(&task_id, || {
            let event = decode(body)?;
            handler(event, task)
        });
    })
}

fn failure_or_noop(on_failure: Option<FailureCallback>) -> ResultCallback {
    on_failure.unwrap_or_else(|| Box::new(|_| {}))
}

fn passthrough(
    on_success: Option<SuccessCallback<Value>>,
    on_failure: Option<FailureCallback>,
) -> BridgeCallbacks {
    BridgeCallbacks::new(
        on_success.unwrap_or_else(|| Box::new(|_| {})),
        failure_or_noop(on_failure),
    )
}

/// Decode the success payload; a payload that does not decode goes to the failure callback
fn typed<T: 'static>(
    on_success: SuccessCallback<T>,
    on_failure: Option<FailureCallback>,
    decode: fn(Value) -> GResult<T>,
) -> BridgeCallbacks {
    let on_failure: Arc<dyn Fn(Value) + Send + Sync> = Arc::from(failure_or_noop(on_failure));
    let decode_failure = Arc::clone(&on_failure);
    BridgeCallbacks::new(
        Box::new(move |payload| match decode(payload) {
            Ok(value) => on_success(value),
            Err(e) => {
                log::warn!("{}", e);
                decode_failure(Value::String(e.to_string()))
            }
        }),
        Box::new(move |payload| on_failure(payload)),
    )
}
