//! The environment interface the core drives: the replay/recording
//! side implements it for real workers, [`crate::TestWorkflowEnvironment`]
//! implements it in-process.
//!
//! All callbacks handed to an environment are invoked on the
//! environment's thread and must not run workflow code directly; they
//! post results into futures observed by the dispatcher on its next
//! pump.

use std::time::{Duration, SystemTime};

use crate::error::WorkflowError;
use crate::EncodedValue;

/// Change version returned by `get_version`.
pub type Version = i32;

/// Version of workflow code that was not versioned before.
pub const DEFAULT_VERSION: Version = -1;

/// Identifies a workflow type by registered name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowType {
    pub name: String,
}

/// Identifies an activity type by registered name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityType {
    pub name: String,
}

/// Workflow execution identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

/// Information about the currently executing workflow. Immutable for
/// the lifetime of the execution. Timeouts have second granularity.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub task_list_name: String,
    pub execution_start_to_close_timeout: Duration,
    pub task_start_to_close_timeout: Duration,
    pub domain: String,
}

/// Behavior applied to a child workflow when its parent is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildWorkflowPolicy {
    #[default]
    Terminate,
    RequestCancel,
    Abandon,
}

/// Options for scheduling a child workflow, applied to a context with
/// [`crate::WorkflowContext::with_child_workflow_options`]. Unset
/// strings and zero durations fall back to the parent workflow's
/// values; the execution timeout is mandatory.
#[derive(Debug, Clone, Default)]
pub struct ChildWorkflowOptions {
    pub domain: String,
    pub workflow_id: String,
    pub task_list: String,
    pub execution_start_to_close_timeout: Duration,
    pub task_start_to_close_timeout: Duration,
    pub child_policy: ChildWorkflowPolicy,
    pub wait_for_cancellation: bool,
}

/// Options for scheduling activities, applied to a context with
/// [`crate::WorkflowContext::with_activity_options`].
/// `schedule_to_start_timeout` and `start_to_close_timeout` are
/// mandatory; the rest default.
#[derive(Debug, Clone, Default)]
pub struct ActivityOptions {
    pub task_list: String,
    pub schedule_to_close_timeout: Duration,
    pub schedule_to_start_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub wait_for_cancellation: bool,
    pub activity_id: String,
}

/// Identifier of a scheduled activity, used for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivityId(pub String);

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a scheduled timer, used for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(pub String);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully resolved parameters submitted to the environment for one
/// activity execution.
#[derive(Debug, Clone)]
pub struct ExecuteActivityParams {
    pub activity_type: ActivityType,
    pub input: EncodedValue,
    pub task_list: String,
    pub schedule_to_close_timeout: Duration,
    pub schedule_to_start_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub wait_for_cancellation: bool,
    pub activity_id: Option<String>,
}

/// Fully resolved parameters submitted to the environment for one
/// child workflow execution.
#[derive(Debug, Clone)]
pub struct ExecuteChildWorkflowParams {
    pub workflow_type: WorkflowType,
    pub input: EncodedValue,
    pub domain: String,
    pub task_list: String,
    pub workflow_id: String,
    pub execution_start_to_close_timeout: Duration,
    pub task_start_to_close_timeout: Duration,
    pub child_policy: ChildWorkflowPolicy,
    pub wait_for_cancellation: bool,
}

/// Completion callback for an asynchronous environment operation.
pub type ResultHandler = Box<dyn FnOnce(Result<EncodedValue, WorkflowError>) + Send>;

/// Callback fired once a child workflow execution has started.
pub type StartedHandler = Box<dyn FnOnce(Result<WorkflowExecution, WorkflowError>) + Send>;

/// One-shot producer recorded by `side_effect`.
pub type SideEffectProducer = Box<dyn FnOnce() -> Result<EncodedValue, WorkflowError> + Send>;

/// The replay/recording side consumed by the workflow core.
///
/// Implementations own threading and persistence; the core only
/// requires that result callbacks are not invoked re-entrantly from
/// inside a dispatcher pump.
pub trait WorkflowEnvironment: Send + Sync {
    fn workflow_info(&self) -> WorkflowInfo;

    /// Report workflow completion (result or failure).
    fn complete(&self, result: Result<EncodedValue, WorkflowError>);

    fn execute_activity(&self, params: ExecuteActivityParams, callback: ResultHandler)
        -> ActivityId;

    fn request_cancel_activity(&self, activity_id: &ActivityId);

    fn execute_child_workflow(
        &self,
        params: ExecuteChildWorkflowParams,
        callback: ResultHandler,
        started: StartedHandler,
    );

    fn request_cancel_workflow(&self, domain: &str, workflow_id: &str, run_id: &str);

    /// Schedule a timer. Returns `None` when no timer was scheduled
    /// (the callback will then never fire).
    fn new_timer(&self, duration: Duration, callback: ResultHandler) -> Option<TimerId>;

    fn request_cancel_timer(&self, timer_id: &TimerId);

    /// Run `producer` once, record its bytes, and deliver them (the
    /// recorded bytes on replay) through `callback`.
    fn side_effect(&self, producer: SideEffectProducer, callback: ResultHandler);

    /// Record `max_supported` on first execution; return the recorded
    /// version on replay, validating it against the supported range.
    fn get_version(&self, change_id: &str, min_supported: Version, max_supported: Version)
        -> Version;

    fn register_cancel_handler(&self, handler: Box<dyn Fn() + Send + Sync>);

    fn register_signal_handler(&self, handler: Box<dyn Fn(&str, EncodedValue) + Send + Sync>);

    /// Workflow-observable current time (decision start time, or the
    /// virtual clock in tests). Never wall clock.
    fn now(&self) -> SystemTime;
}
