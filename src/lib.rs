// Background Geolocation bridge library
// Typed client over the native background geolocation plugin, with the
// background-task acknowledgment protocol enforced on every delivery

pub mod android_jni;
pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod normalizer;
pub mod session;
pub mod task_runner;
pub mod types;

pub use bridge::{Action, NativeBridge, RecordingBridge};
pub use config::Config;
pub use error::{GResult, GeolocationError};
pub use normalizer::NativeEvent;
pub use session::BackgroundGeolocation;
pub use task_runner::{BackgroundTask, BackgroundTaskRunner, TaskAcknowledger};
pub use types::{Geofence, GeofenceAction, GeofenceEvent, Location, TaskId, TaskOutcome};
