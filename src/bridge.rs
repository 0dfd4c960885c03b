use crate::error::{GResult, GeolocationError};
use crate::task_runner::panic_message;
use crate::types::{TaskId, TaskOutcome};
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Service name every call is addressed to on the native side
pub const SERVICE: &str = "BackgroundGeoLocation";

/// Operations understood by the native plugin, with their wire names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Configure,
    Start,
    Stop,
    Finish,
    Error,
    OnPaceChange,
    SetConfig,
    GetStationaryLocation,
    AddStationaryRegionListener,
    GetLocations,
    Sync,
    GetOdometer,
    ResetOdometer,
    AddGeofence,
    RemoveGeofence,
    OnGeofence,
    GetGeofences,
    PlaySound,
}

impl Action {
    pub const ALL: [Action; 18] = [
        Action::Configure,
        Action::Start,
        Action::Stop,
        Action::Finish,
        Action::Error,
        Action::OnPaceChange,
        Action::SetConfig,
        Action::GetStationaryLocation,
        Action::AddStationaryRegionListener,
        Action::GetLocations,
        Action::Sync,
        Action::GetOdometer,
        Action::ResetOdometer,
        Action::AddGeofence,
        Action::RemoveGeofence,
        Action::OnGeofence,
        Action::GetGeofences,
        Action::PlaySound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Configure => "configure",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Finish => "finish",
            Action::Error => "error",
            Action::OnPaceChange => "onPaceChange",
            Action::SetConfig => "setConfig",
            Action::GetStationaryLocation => "getStationaryLocation",
            Action::AddStationaryRegionListener => "addStationaryRegionListener",
            Action::GetLocations => "getLocations",
            Action::Sync => "sync",
            Action::GetOdometer => "getOdometer",
            Action::ResetOdometer => "resetOdometer",
            Action::AddGeofence => "addGeofence",
            Action::RemoveGeofence => "removeGeofence",
            Action::OnGeofence => "onGeofence",
            Action::GetGeofences => "getGeofences",
            Action::PlaySound => "playSound",
        }
    }

    pub fn parse(name: &str) -> Option<Action> {
        Action::ALL.iter().copied().find(|a| a.as_str() == name)
    }

    /// Registrations whose callback the native side keeps firing
    pub fn is_recurring(&self) -> bool {
        matches!(
            self,
            Action::Configure | Action::AddStationaryRegionListener | Action::OnGeofence
        )
    }
}

pub type ResultCallback = Box<dyn Fn(Value) + Send + Sync>;

/// Success/failure pair attached to a bridge call
pub struct BridgeCallbacks {
    pub on_success: ResultCallback,
    pub on_failure: ResultCallback,
}

impl BridgeCallbacks {
    pub fn new(on_success: ResultCallback, on_failure: ResultCallback) -> Self {
        BridgeCallbacks {
            on_success,
            on_failure,
        }
    }

    pub fn noop() -> Self {
        BridgeCallbacks {
            on_success: Box::new(|_| {}),
            on_failure: Box::new(|_| {}),
        }
    }
}

/// One invocation of the native plugin
pub struct BridgeCall {
    pub service: &'static str,
    pub action: Action,
    pub args: Vec<Value>,
    pub callbacks: BridgeCallbacks,
}

impl BridgeCall {
    pub fn new(action: Action, args: Vec<Value>, callbacks: BridgeCallbacks) -> Self {
        BridgeCall {
            service: SERVICE,
            action,
            args,
            callbacks,
        }
    }
}

/// Native collaborator boundary: marshals a call across and later reports back through
/// the call's callbacks, possibly from another thread.
pub trait NativeBridge: Send + Sync {
    fn exec(&self, call: BridgeCall) -> GResult<()>;
}

pub type CallbackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Ok,
    Error,
}

/// Result posted by the native side for a registered callback
#[derive(Debug, Clone)]
pub struct Delivery {
    pub callback_id: CallbackId,
    pub status: DeliveryStatus,
    pub payload: Value,
    pub keep_callback: bool,
}

/// Pending callbacks keyed by id, plus the queue native threads post results into.
///
/// `post` is safe from any thread. `dispatch_pending` runs queued deliveries one at a
/// time on the calling thread, each to completion before the next.
pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<CallbackId, Arc<BridgeCallbacks>>>,
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        CallbackRegistry {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(HashMap::new()),
            sender,
            receiver,
        }
    }

    pub fn register(&self, callbacks: BridgeCallbacks) -> GResult<CallbackId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .map_err(|_| GeolocationError::Internal("Failed to acquire callback lock".to_string()))?
            .insert(id, Arc::new(callbacks));
        Ok(id)
    }

    /// Drop a registration whose call never reached the native side
    pub fn unregister(&self, id: CallbackId) -> GResult<bool> {
        Ok(self
            .callbacks
            .lock()
            .map_err(|_| GeolocationError::Internal("Failed to acquire callback lock".to_string()))?
            .remove(&id)
            .is_some())
    }

    pub fn pending_count(&self) -> GResult<usize> {
        Ok(self
            .callbacks
            .lock()
            .map_err(|_| GeolocationError::Internal("Failed to acquire callback lock".to_string()))?
            .len())
    }

    /// Queue a delivery for the dispatching thread
    pub fn post(&self, delivery: Delivery) -> GResult<()> {
        self.sender
            .send(delivery)
            .map_err(|_| GeolocationError::Internal("Delivery queue disconnected".to_string()))
    }

    /// Run every queued delivery; returns how many reached a callback
    pub fn dispatch_pending(&self) -> GResult<usize> {
        let mut dispatched = 0;
        while let Ok(delivery) = self.receiver.try_recv() {
            if self.dispatch(delivery)? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Invoke the callback a delivery targets. Unknown ids are dropped.
    pub fn dispatch(&self, delivery: Delivery) -> GResult<bool> {
        // Lock released before invoking: callbacks re-enter the bridge (finish/error).
        let callbacks = {
            let mut map = self.callbacks.lock().map_err(|_| {
                GeolocationError::Internal("Failed to acquire callback lock".to_string())
            })?;
            if delivery.keep_callback {
                map.get(&delivery.callback_id).cloned()
            } else {
                map.remove(&delivery.callback_id)
            }
        };

        let Some(callbacks) = callbacks else {
            log::warn!(
                "Dropping delivery for unknown callback id {}",
                delivery.callback_id
            );
            return Ok(false);
        };

        log::debug!(
            "Dispatching {:?} delivery to callback {} (keep={})",
            delivery.status,
            delivery.callback_id,
            delivery.keep_callback
        );
        let status = delivery.status;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match status {
            DeliveryStatus::Ok => (callbacks.on_success)(delivery.payload),
            DeliveryStatus::Error => (callbacks.on_failure)(delivery.payload),
        }));
        // A panicking callback must not unwind into the native caller
        if let Err(payload) = outcome {
            log::error!(
                "Callback {} panicked on {:?} delivery: {}",
                delivery.callback_id,
                status,
                panic_message(payload.as_ref())
            );
        }
        Ok(true)
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Call as seen by the in-process collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub service: String,
    pub action: Action,
    pub args: Vec<Value>,
    pub callback_id: CallbackId,
}

/// In-process collaborator that records every call and lets the caller play the
/// native side by delivering results to them.
pub struct RecordingBridge {
    registry: CallbackRegistry,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        RecordingBridge {
            registry: CallbackRegistry::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn calls(&self) -> GResult<Vec<RecordedCall>> {
        Ok(self
            .calls
            .lock()
            .map_err(|_| GeolocationError::Internal("Failed to acquire call log lock".to_string()))?
            .clone())
    }

    pub fn calls_for(&self, action: Action) -> GResult<Vec<RecordedCall>> {
        Ok(self
            .calls()?
            .into_iter()
            .filter(|c| c.action == action)
            .collect())
    }

    pub fn last_call(&self, action: Action) -> GResult<Option<RecordedCall>> {
        Ok(self.calls_for(action)?.pop())
    }

    /// Deliver a success payload to the most recent call of `action`
    pub fn succeed(&self, action: Action, payload: Value) -> GResult<usize> {
        self.deliver(action, DeliveryStatus::Ok, payload)
    }

    /// Deliver a failure payload to the most recent call of `action`
    pub fn fail(&self, action: Action, payload: Value) -> GResult<usize> {
        self.deliver(action, DeliveryStatus::Error, payload)
    }

    fn deliver(&self, action: Action, status: DeliveryStatus, payload: Value) -> GResult<usize> {
        let call = self.last_call(action)?.ok_or_else(|| {
            GeolocationError::Bridge(format!("no pending '{}' call", action.as_str()))
        })?;
        self.registry.post(Delivery {
            callback_id: call.callback_id,
            status,
            payload,
            keep_callback: action.is_recurring(),
        })?;
        self.registry.dispatch_pending()
    }

    /// Terminal acknowledgments sent so far, in order
    pub fn acknowledgments(&self) -> GResult<Vec<(TaskId, TaskOutcome)>> {
        let acks = self
            .calls()?
            .into_iter()
            .filter_map(|call| {
                let task_id = TaskId::from(call.args.first()?.as_str()?);
                match call.action {
                    Action::Finish => Some((task_id, TaskOutcome::Finished)),
                    Action::Error => {
                        let message = call
                            .args
                            .get(1)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        Some((task_id, TaskOutcome::Failed(message)))
                    }
                    _ => None,
                }
            })
            .collect();
        Ok(acks)
    }
}

impl Default for RecordingBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBridge for RecordingBridge {
    fn exec(&self, call: BridgeCall) -> GResult<()> {
        let callback_id = self.registry.register(call.callbacks)?;
        log::debug!(
            "{}.{} {:?} -> callback {}",
            call.service,
            call.action.as_str(),
            call.args,
            callback_id
        );
        self.calls
            .lock()
            .map_err(|_| GeolocationError::Internal("Failed to acquire call log lock".to_string()))?
            .push(RecordedCall {
                service: call.service.to_string(),
                action: call.action,
                args: call.args,
                callback_id,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_callbacks(hits: Arc<AtomicUsize>, failures: Arc<AtomicUsize>) -> BridgeCallbacks {
        BridgeCallbacks::new(
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_action_wire_names() {
        for action in Action::ALL {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::OnPaceChange.as_str(), "onPaceChange");
        assert_eq!(
            Action::AddStationaryRegionListener.as_str(),
            "addStationaryRegionListener"
        );
        assert_eq!(Action::parse("changePace"), None);
        assert!(Action::OnGeofence.is_recurring());
        assert!(!Action::GetLocations.is_recurring());
    }

    #[test]
    fn test_one_shot_callback_removed_after_delivery() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let id = registry
            .register(counting_callbacks(hits.clone(), failures.clone()))
            .unwrap();

        for _ in 0..2 {
            registry
                .post(Delivery {
                    callback_id: id,
                    status: DeliveryStatus::Ok,
                    payload: json!(1),
                    keep_callback: false,
                })
                .unwrap();
        }

        assert_eq!(registry.dispatch_pending().unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_kept_callback_fires_repeatedly() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let id = registry
            .register(counting_callbacks(hits.clone(), failures.clone()))
            .unwrap();

        for status in [DeliveryStatus::Ok, DeliveryStatus::Ok, DeliveryStatus::Error] {
            registry
                .post(Delivery {
                    callback_id: id,
                    status,
                    payload: Value::Null,
                    keep_callback: true,
                })
                .unwrap();
        }

        assert_eq!(registry.dispatch_pending().unwrap(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_count().unwrap(), 1);

        assert!(registry.unregister(id).unwrap());
        assert!(!registry.unregister(id).unwrap());
    }

    #[test]
    fn test_post_from_native_thread() {
        let registry = Arc::new(CallbackRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let id = registry
            .register(counting_callbacks(hits.clone(), failures))
            .unwrap();

        let poster = Arc::clone(&registry);
        std::thread::spawn(move || {
            poster
                .post(Delivery {
                    callback_id: id,
                    status: DeliveryStatus::Ok,
                    payload: json!({"taskId": "t1"}),
                    keep_callback: false,
                })
                .unwrap();
        })
        .join()
        .unwrap();

        // Nothing runs until the owning thread dispatches
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(registry.dispatch_pending().unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_contained() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let panicking = registry
            .register(BridgeCallbacks::new(
                Box::new(|_| {}),
                Box::new(|_| panic!("failure callback crashed")),
            ))
            .unwrap();
        let healthy = registry
            .register(BridgeCallbacks::new(
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Box::new(|_| {}),
            ))
            .unwrap();

        for (callback_id, status) in [(panicking, DeliveryStatus::Error), (healthy, DeliveryStatus::Ok)] {
            registry
                .post(Delivery {
                    callback_id,
                    status,
                    payload: json!("denied"),
                    keep_callback: false,
                })
                .unwrap();
        }

        // The queue keeps draining past the panic
        assert_eq!(registry.dispatch_pending().unwrap(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_recording_bridge_acknowledgments() {
        let bridge = RecordingBridge::new();
        bridge
            .exec(BridgeCall::new(
                Action::Finish,
                vec![json!("t1")],
                BridgeCallbacks::noop(),
            ))
            .unwrap();
        bridge
            .exec(BridgeCall::new(
                Action::Error,
                vec![json!("t2"), json!("boom")],
                BridgeCallbacks::noop(),
            ))
            .unwrap();

        let calls = bridge.calls().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].service, "BackgroundGeoLocation");
        assert_eq!(
            bridge.acknowledgments().unwrap(),
            vec![
                (TaskId::from("t1"), TaskOutcome::Finished),
                (TaskId::from("t2"), TaskOutcome::Failed("boom".into())),
            ]
        );
        assert!(bridge.succeed(Action::Sync, Value::Null).is_err());
    }
}
