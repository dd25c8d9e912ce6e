//! Mock results, function overrides, and lifecycle listeners for the
//! test environment. Mocks and overrides are shared with child
//! workflow environments; listeners are per environment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::env::{ActivityId, TimerId, WorkflowExecution};
use crate::error::WorkflowError;
use crate::registry::{ActivityHandler, WorkflowHandler};
use crate::EncodedValue;

/// Identity of one activity execution, handed to listeners.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub activity_id: ActivityId,
    pub activity_type: String,
    pub workflow_execution: WorkflowExecution,
}

struct MockEntry {
    name: String,
    /// `None` matches any arguments.
    args: Option<EncodedValue>,
    result: Result<EncodedValue, WorkflowError>,
}

/// Canned results matched by `(name, encoded-args)`; an entry without
/// arguments matches any call of that name. First match wins.
#[derive(Default)]
pub(crate) struct MockResponders {
    activities: Mutex<Vec<MockEntry>>,
    workflows: Mutex<Vec<MockEntry>>,
}

impl MockResponders {
    pub(crate) fn add_activity(
        &self,
        name: String,
        args: Option<EncodedValue>,
        result: Result<EncodedValue, WorkflowError>,
    ) {
        self.activities.lock().unwrap().push(MockEntry { name, args, result });
    }

    pub(crate) fn add_workflow(
        &self,
        name: String,
        args: Option<EncodedValue>,
        result: Result<EncodedValue, WorkflowError>,
    ) {
        self.workflows.lock().unwrap().push(MockEntry { name, args, result });
    }

    pub(crate) fn find_activity(
        &self,
        name: &str,
        input: &EncodedValue,
    ) -> Option<Result<EncodedValue, WorkflowError>> {
        Self::find(&self.activities.lock().unwrap(), name, input)
    }

    pub(crate) fn find_workflow(
        &self,
        name: &str,
        input: &EncodedValue,
    ) -> Option<Result<EncodedValue, WorkflowError>> {
        Self::find(&self.workflows.lock().unwrap(), name, input)
    }

    fn find(
        entries: &[MockEntry],
        name: &str,
        input: &EncodedValue,
    ) -> Option<Result<EncodedValue, WorkflowError>> {
        entries
            .iter()
            .find(|e| e.name == name && e.args.as_ref().map_or(true, |a| a == input))
            .map(|e| e.result.clone())
    }
}

/// Whole-function substitutes, keyed by registered name. An override
/// replaces the real implementation while keeping its signature.
#[derive(Default)]
pub(crate) struct Overrides {
    activities: Mutex<HashMap<String, Arc<dyn ActivityHandler>>>,
    workflows: Mutex<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

impl Overrides {
    pub(crate) fn set_activity(&self, name: String, handler: Arc<dyn ActivityHandler>) {
        self.activities.lock().unwrap().insert(name, handler);
    }

    pub(crate) fn set_workflow(&self, name: String, handler: Arc<dyn WorkflowHandler>) {
        self.workflows.lock().unwrap().insert(name, handler);
    }

    pub(crate) fn activity(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.activities.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn workflow(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.workflows.lock().unwrap().get(name).cloned()
    }
}

type ActivityStartedListener = Box<dyn Fn(&ActivityInfo, &EncodedValue) + Send + Sync>;
type ActivityCompletedListener =
    Box<dyn Fn(&ActivityInfo, &Result<EncodedValue, WorkflowError>) + Send + Sync>;
type ActivityCanceledListener = Box<dyn Fn(&ActivityInfo) + Send + Sync>;
type ActivityHeartbeatListener = Box<dyn Fn(&ActivityInfo, &EncodedValue) + Send + Sync>;
type ChildStartedListener = Box<dyn Fn(&WorkflowExecution, &EncodedValue) + Send + Sync>;
type ChildCompletedListener =
    Box<dyn Fn(&WorkflowExecution, &Result<EncodedValue, WorkflowError>) + Send + Sync>;
type ChildCanceledListener = Box<dyn Fn(&WorkflowExecution) + Send + Sync>;
type TimerScheduledListener = Box<dyn Fn(&TimerId, Duration) + Send + Sync>;
type TimerListener = Box<dyn Fn(&TimerId) + Send + Sync>;

/// Purely observational lifecycle callbacks.
#[derive(Default)]
pub(crate) struct Listeners {
    pub(crate) on_activity_started: Mutex<Option<ActivityStartedListener>>,
    pub(crate) on_activity_completed: Mutex<Option<ActivityCompletedListener>>,
    pub(crate) on_activity_canceled: Mutex<Option<ActivityCanceledListener>>,
    pub(crate) on_activity_heartbeat: Mutex<Option<ActivityHeartbeatListener>>,
    pub(crate) on_child_workflow_started: Mutex<Option<ChildStartedListener>>,
    pub(crate) on_child_workflow_completed: Mutex<Option<ChildCompletedListener>>,
    pub(crate) on_child_workflow_canceled: Mutex<Option<ChildCanceledListener>>,
    pub(crate) on_timer_scheduled: Mutex<Option<TimerScheduledListener>>,
    pub(crate) on_timer_fired: Mutex<Option<TimerListener>>,
    pub(crate) on_timer_canceled: Mutex<Option<TimerListener>>,
}

impl Listeners {
    pub(crate) fn notify_timer_scheduled(&self, id: &TimerId, d: Duration) {
        if let Some(l) = &*self.on_timer_scheduled.lock().unwrap() {
            l(id, d);
        }
    }

    pub(crate) fn notify_timer_fired(&self, id: &TimerId) {
        if let Some(l) = &*self.on_timer_fired.lock().unwrap() {
            l(id);
        }
    }

    pub(crate) fn notify_timer_canceled(&self, id: &TimerId) {
        if let Some(l) = &*self.on_timer_canceled.lock().unwrap() {
            l(id);
        }
    }

    pub(crate) fn notify_activity_started(&self, info: &ActivityInfo, input: &EncodedValue) {
        if let Some(l) = &*self.on_activity_started.lock().unwrap() {
            l(info, input);
        }
    }

    pub(crate) fn notify_activity_completed(
        &self,
        info: &ActivityInfo,
        result: &Result<EncodedValue, WorkflowError>,
    ) {
        if let Some(l) = &*self.on_activity_completed.lock().unwrap() {
            l(info, result);
        }
    }

    pub(crate) fn notify_activity_canceled(&self, info: &ActivityInfo) {
        if let Some(l) = &*self.on_activity_canceled.lock().unwrap() {
            l(info);
        }
    }

    pub(crate) fn notify_activity_heartbeat(&self, info: &ActivityInfo, details: &EncodedValue) {
        if let Some(l) = &*self.on_activity_heartbeat.lock().unwrap() {
            l(info, details);
        }
    }

    pub(crate) fn notify_child_started(&self, execution: &WorkflowExecution, input: &EncodedValue) {
        if let Some(l) = &*self.on_child_workflow_started.lock().unwrap() {
            l(execution, input);
        }
    }

    pub(crate) fn notify_child_completed(
        &self,
        execution: &WorkflowExecution,
        result: &Result<EncodedValue, WorkflowError>,
    ) {
        if let Some(l) = &*self.on_child_workflow_completed.lock().unwrap() {
            l(execution, result);
        }
    }

    pub(crate) fn notify_child_canceled(&self, execution: &WorkflowExecution) {
        if let Some(l) = &*self.on_child_workflow_canceled.lock().unwrap() {
            l(execution);
        }
    }
}
