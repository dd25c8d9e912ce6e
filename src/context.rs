//! Immutable workflow context.
//!
//! A context is a small value sharing structure with its parent
//! through `Arc`s: the environment handle, the workflow result cell,
//! the current coroutine state, the per-workflow options struct, the
//! cancel scope, and a persistent list of user values. Builders return
//! a new context; the mutable options struct is allocated lazily and
//! then shared by every derived context.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use crate::channel::Channel;
use crate::dispatcher::CoroutineState;
use crate::env::{
    ActivityOptions, ChildWorkflowOptions, ChildWorkflowPolicy, WorkflowEnvironment, WorkflowInfo,
};
use crate::error::WorkflowError;
use crate::EncodedValue;

/// Buffer size of lazily created signal channels. Exhausting it means
/// the workflow is ignoring its signals.
pub(crate) const DEFAULT_SIGNAL_CHANNEL_SIZE: usize = 100_000;

pub(crate) type ResultCell = Arc<Mutex<Option<Result<EncodedValue, WorkflowError>>>>;

pub(crate) type QueryHandler =
    Arc<dyn Fn(EncodedValue) -> Result<EncodedValue, WorkflowError> + Send + Sync>;

/// Mutable per-workflow options hung off the context. Allocated once
/// per workflow; builders mutate the shared struct.
#[derive(Default)]
pub(crate) struct WorkflowOptionsState {
    pub(crate) workflow_id: String,
    pub(crate) domain: Option<String>,
    pub(crate) task_list_name: Option<String>,
    pub(crate) execution_start_to_close_timeout: Option<Duration>,
    pub(crate) task_start_to_close_timeout: Option<Duration>,
    pub(crate) child_policy: ChildWorkflowPolicy,
    pub(crate) wait_for_cancellation: bool,
    pub(crate) signal_channels: HashMap<String, Channel<EncodedValue>>,
    pub(crate) query_handlers: HashMap<String, QueryHandler>,
}

impl WorkflowOptionsState {
    /// Channel for the named signal, created on first use with the
    /// default buffering.
    pub(crate) fn signal_channel(&mut self, name: &str) -> Channel<EncodedValue> {
        self.signal_channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(format!("signal-{name}"), DEFAULT_SIGNAL_CHANNEL_SIZE))
            .clone()
    }

    /// Names of signal channels that still hold undelivered data.
    pub(crate) fn unhandled_signals(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .signal_channels
            .iter()
            .filter(|(_, ch)| ch.probe_pending())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Cancel scope: a `done` channel closed exactly once plus the
/// canceled sentinel. Scopes form a tree; canceling a scope cancels
/// every scope derived from it.
pub(crate) struct CancelScope {
    done: Channel<()>,
    err: Mutex<Option<WorkflowError>>,
    canceled: AtomicBool,
    children: Mutex<Vec<Weak<CancelScope>>>,
}

impl CancelScope {
    fn new() -> Self {
        CancelScope {
            done: Channel::new("done", 0),
            err: Mutex::new(None),
            canceled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.err.lock().unwrap() = Some(WorkflowError::canceled());
        self.done.close();
        let children = std::mem::take(&mut *self.children.lock().unwrap());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// Cancels the context it was created from. Calling it more than once
/// is fine; the context stays canceled.
#[derive(Clone)]
pub struct CancelHandle {
    scope: Arc<CancelScope>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.scope.cancel();
    }
}

struct ValueNode {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<ValueNode>>,
}

/// Context threaded through every workflow operation. Cheap to clone
/// and to derive; derived contexts share structure with their parent.
#[derive(Clone)]
pub struct WorkflowContext {
    env: Option<Arc<dyn WorkflowEnvironment>>,
    result: Option<ResultCell>,
    state: Option<Arc<CoroutineState>>,
    options: Option<Arc<Mutex<WorkflowOptionsState>>>,
    activity_options: Option<Arc<Mutex<ActivityOptions>>>,
    cancel: Option<Arc<CancelScope>>,
    values: Option<Arc<ValueNode>>,
}

impl WorkflowContext {
    fn bare() -> Self {
        WorkflowContext {
            env: None,
            result: None,
            state: None,
            options: None,
            activity_options: None,
            cancel: None,
            values: None,
        }
    }

    /// Root context of one workflow execution, built by the driver.
    pub(crate) fn new_root(env: Arc<dyn WorkflowEnvironment>) -> (Self, ResultCell) {
        let result: ResultCell = Arc::new(Mutex::new(None));
        let ctx = WorkflowContext {
            env: Some(env),
            result: Some(result.clone()),
            ..WorkflowContext::bare()
        };
        (ctx, result)
    }

    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        WorkflowContext::bare()
    }

    pub(crate) fn env(&self) -> &Arc<dyn WorkflowEnvironment> {
        self.env
            .as_ref()
            .expect("not a workflow context: no environment attached")
    }

    pub(crate) fn result_cell(&self) -> &ResultCell {
        self.result
            .as_ref()
            .expect("not a workflow context: no result cell attached")
    }

    pub(crate) fn coroutine_state(&self) -> &Arc<CoroutineState> {
        self.state
            .as_ref()
            .expect("not called from workflow coroutine code")
    }

    pub(crate) fn with_coroutine_state(&self, state: Arc<CoroutineState>) -> Self {
        let mut ctx = self.clone();
        ctx.state = Some(state);
        ctx
    }

    pub(crate) fn next_channel_name(&self) -> String {
        match &self.state {
            Some(state) => state.dispatcher().next_channel_name(),
            None => "chan".to_string(),
        }
    }

    pub(crate) fn next_selector_name(&self) -> String {
        match &self.state {
            Some(state) => state.dispatcher().next_selector_name(),
            None => "selector".to_string(),
        }
    }

    /// Information about the executing workflow.
    pub fn workflow_info(&self) -> WorkflowInfo {
        self.env().workflow_info()
    }

    /// Current workflow time. Use this instead of the system clock;
    /// it is the decision start time (virtual time in tests).
    pub fn now(&self) -> SystemTime {
        self.env().now()
    }

    // ---------------- cancellation

    /// Derive a cancelable context. Canceling the parent scope also
    /// cancels the derived one.
    pub fn with_cancel(&self) -> (WorkflowContext, CancelHandle) {
        let scope = Arc::new(CancelScope::new());
        if let Some(parent) = &self.cancel {
            if parent.is_canceled() {
                scope.cancel();
            } else {
                parent.children.lock().unwrap().push(Arc::downgrade(&scope));
            }
        }
        let mut ctx = self.clone();
        ctx.cancel = Some(scope.clone());
        (ctx, CancelHandle { scope })
    }

    /// Channel closed when this context is canceled; `None` for a
    /// non-cancelable context.
    pub fn done(&self) -> Option<Channel<()>> {
        self.cancel.as_ref().map(|scope| scope.done.clone())
    }

    /// The canceled sentinel once this context has been canceled.
    pub fn err(&self) -> Option<WorkflowError> {
        self.cancel
            .as_ref()
            .and_then(|scope| scope.err.lock().unwrap().clone())
    }

    // ---------------- user values

    /// Attach a typed value; one value per type, innermost wins.
    pub fn with_value<V: Any + Send + Sync>(&self, value: V) -> WorkflowContext {
        let mut ctx = self.clone();
        ctx.values = Some(Arc::new(ValueNode {
            key: TypeId::of::<V>(),
            value: Arc::new(value),
            parent: self.values.clone(),
        }));
        ctx
    }

    /// Look up a value attached with [`WorkflowContext::with_value`].
    pub fn value<V: Any + Send + Sync>(&self) -> Option<Arc<V>> {
        let mut node = self.values.as_ref();
        while let Some(n) = node {
            if n.key == TypeId::of::<V>() {
                return n.value.clone().downcast::<V>().ok();
            }
            node = n.parent.as_ref();
        }
        None
    }

    // ---------------- workflow options

    pub(crate) fn options(&self) -> Option<&Arc<Mutex<WorkflowOptionsState>>> {
        self.options.as_ref()
    }

    pub(crate) fn with_options_if_not_exist(&self) -> WorkflowContext {
        if self.options.is_some() {
            return self.clone();
        }
        let mut ctx = self.clone();
        ctx.options = Some(Arc::new(Mutex::new(WorkflowOptionsState::default())));
        ctx
    }

    fn mutate_options(&self, f: impl FnOnce(&mut WorkflowOptionsState)) -> WorkflowContext {
        let ctx = self.with_options_if_not_exist();
        f(&mut ctx.options.as_ref().unwrap().lock().unwrap());
        ctx
    }

    /// Apply all child workflow options to the context.
    pub fn with_child_workflow_options(&self, cwo: ChildWorkflowOptions) -> WorkflowContext {
        self.mutate_options(|o| {
            if !cwo.domain.is_empty() {
                o.domain = Some(cwo.domain);
            }
            if !cwo.task_list.is_empty() {
                o.task_list_name = Some(cwo.task_list);
            }
            o.workflow_id = cwo.workflow_id;
            o.execution_start_to_close_timeout = Some(cwo.execution_start_to_close_timeout);
            o.task_start_to_close_timeout = Some(cwo.task_start_to_close_timeout);
            o.child_policy = cwo.child_policy;
            o.wait_for_cancellation = cwo.wait_for_cancellation;
        })
    }

    pub fn with_workflow_domain(&self, name: impl Into<String>) -> WorkflowContext {
        let name = name.into();
        self.mutate_options(|o| o.domain = Some(name))
    }

    pub fn with_workflow_task_list(&self, name: impl Into<String>) -> WorkflowContext {
        let name = name.into();
        self.mutate_options(|o| o.task_list_name = Some(name))
    }

    pub fn with_workflow_id(&self, workflow_id: impl Into<String>) -> WorkflowContext {
        let workflow_id = workflow_id.into();
        self.mutate_options(|o| o.workflow_id = workflow_id)
    }

    pub fn with_child_policy(&self, policy: ChildWorkflowPolicy) -> WorkflowContext {
        self.mutate_options(|o| o.child_policy = policy)
    }

    pub fn with_execution_start_to_close_timeout(&self, d: Duration) -> WorkflowContext {
        self.mutate_options(|o| o.execution_start_to_close_timeout = Some(d))
    }

    pub fn with_workflow_task_start_to_close_timeout(&self, d: Duration) -> WorkflowContext {
        self.mutate_options(|o| o.task_start_to_close_timeout = Some(d))
    }

    // ---------------- activity options

    pub(crate) fn activity_options(&self) -> Option<&Arc<Mutex<ActivityOptions>>> {
        self.activity_options.as_ref()
    }

    /// Apply activity options used by every `execute_activity` under
    /// this context.
    pub fn with_activity_options(&self, ao: ActivityOptions) -> WorkflowContext {
        let mut ctx = self.clone();
        ctx.activity_options = Some(Arc::new(Mutex::new(ao)));
        ctx
    }
}
