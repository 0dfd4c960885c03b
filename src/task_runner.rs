use crate::bridge::{Action, BridgeCall, BridgeCallbacks, NativeBridge};
use crate::error::{GResult, GeolocationError};
use crate::types::{TaskId, TaskOutcome};
use serde_json::json;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Sends terminal acknowledgments (`finish` / `error`) for background tasks
#[derive(Clone)]
pub struct TaskAcknowledger {
    bridge: Arc<dyn NativeBridge>,
}

impl TaskAcknowledger {
    pub fn new(bridge: Arc<dyn NativeBridge>) -> Self {
        TaskAcknowledger { bridge }
    }

    /// Signal the native side that the task completed
    pub fn finish(&self, task_id: &TaskId) -> GResult<()> {
        self.finish_with(task_id, BridgeCallbacks::noop())
    }

    pub fn finish_with(&self, task_id: &TaskId, callbacks: BridgeCallbacks) -> GResult<()> {
        if task_id.is_empty() {
            return Err(GeolocationError::missing(
                "BackgroundGeolocation#finish",
                "a taskId as 1st param, eg: bgGeo.finish(taskId)",
            ));
        }
        self.bridge.exec(BridgeCall::new(
            Action::Finish,
            vec![json!(task_id)],
            callbacks,
        ))
    }

    /// Signal the native side that the task failed with `message`
    pub fn error(&self, task_id: &TaskId, message: &str) -> GResult<()> {
        if task_id.is_empty() {
            return Err(GeolocationError::missing(
                "BackgroundGeolocation#error",
                "a taskId as 1st param, eg: bgGeo.error(taskId, message)",
            ));
        }
        self.bridge.exec(BridgeCall::new(
            Action::Error,
            vec![json!(task_id), json!(message)],
            BridgeCallbacks::noop(),
        ))
    }
}

/// Handle given to user handlers for the task a delivery opened.
///
/// Returning `Ok` from a handler does not acknowledge anything: call `finish` (now or
/// later) to release the native background task.
#[derive(Clone)]
pub struct BackgroundTask {
    id: TaskId,
    ack: TaskAcknowledger,
}

impl BackgroundTask {
    pub fn new(id: TaskId, ack: TaskAcknowledger) -> Self {
        BackgroundTask { id, ack }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn finish(&self) -> GResult<()> {
        self.ack.finish(&self.id)
    }

    pub fn error(&self, message: &str) -> GResult<()> {
        self.ack.error(&self.id, message)
    }
}

/// Runs user handlers for delivered tasks and auto-fails the task when a handler
/// returns an error or panics, so the native side is never left waiting on it.
///
/// Only the synchronous extent of the handler is covered. Work the handler defers
/// elsewhere must acknowledge on its own.
#[derive(Clone)]
pub struct BackgroundTaskRunner {
    ack: TaskAcknowledger,
}

impl BackgroundTaskRunner {
    pub fn new(ack: TaskAcknowledger) -> Self {
        BackgroundTaskRunner { ack }
    }

    pub fn task(&self, id: TaskId) -> BackgroundTask {
        BackgroundTask::new(id, self.ack.clone())
    }

    /// Invoke the handler; returns the outcome sent on its behalf, if any
    pub fn run<F>(&self, task_id: &TaskId, invocation: F) -> Option<TaskOutcome>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let message = match panic::catch_unwind(AssertUnwindSafe(invocation)) {
            Ok(Ok(())) => return None,
            Ok(Err(err)) => {
                log::error!("Handler error detail: {:?}", err);
                err.to_string()
            }
            Err(payload) => panic_message(payload.as_ref()),
        };

        log::error!(
            "BackgroundGeolocation caught an error in application code while running in the background. \
             Auto-failing background-task {} to keep the app alive: {}",
            task_id,
            message
        );

        if let Err(e) = self.ack.error(task_id, &message) {
            log::error!("Failed to report background-task {} failure: {}", task_id, e);
        }
        Some(TaskOutcome::Failed(message))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingBridge;

    fn runner() -> (Arc<RecordingBridge>, BackgroundTaskRunner) {
        let bridge = Arc::new(RecordingBridge::new());
        let ack = TaskAcknowledger::new(bridge.clone());
        (bridge, BackgroundTaskRunner::new(ack))
    }

    #[test]
    fn test_normal_return_sends_nothing() {
        let (bridge, runner) = runner();
        let outcome = runner.run(&TaskId::from("t1"), || Ok(()));
        assert_eq!(outcome, None);
        assert!(bridge.calls().unwrap().is_empty());
    }

    #[test]
    fn test_handler_error_reported_once() {
        let (bridge, runner) = runner();
        let outcome = runner.run(&TaskId::from("t1"), || Err(anyhow::anyhow!("boom")));
        assert_eq!(outcome, Some(TaskOutcome::Failed("boom".into())));
        assert_eq!(
            bridge.acknowledgments().unwrap(),
            vec![(TaskId::from("t1"), TaskOutcome::Failed("boom".into()))]
        );
    }

    #[test]
    fn test_handler_panic_contained() {
        let (bridge, runner) = runner();
        let outcome = runner.run(&TaskId::from("t2"), || panic!("kaboom {}", 7));
        assert_eq!(outcome, Some(TaskOutcome::Failed("kaboom 7".into())));

        let outcome = runner.run(&TaskId::from("t3"), || panic!("static"));
        assert_eq!(outcome, Some(TaskOutcome::Failed("static".into())));
        assert_eq!(bridge.acknowledgments().unwrap().len(), 2);
    }

    #[test]
    fn test_finish_and_error_require_task_id() {
        let (bridge, runner) = runner();
        let task = runner.task(TaskId::from(""));
        assert!(task.finish().unwrap_err().is_validation());
        assert!(task.error("boom").unwrap_err().is_validation());
        assert!(bridge.calls().unwrap().is_empty());

        let task = runner.task(TaskId::from("t4"));
        task.finish().unwrap();
        assert_eq!(
            bridge.acknowledgments().unwrap(),
            vec![(TaskId::from("t4"), TaskOutcome::Finished)]
        );
    }

    #[test]
    fn test_handler_finishing_itself() {
        let (bridge, runner) = runner();
        let task = runner.task(TaskId::from("t5"));
        let outcome = runner.run(task.id(), || {
            task.finish()?;
            Ok(())
        });
        assert_eq!(outcome, None);
        assert_eq!(
            bridge.acknowledgments().unwrap(),
            vec![(TaskId::from("t5"), TaskOutcome::Finished)]
        );
    }
}
