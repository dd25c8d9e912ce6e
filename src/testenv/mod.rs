//! In-process test environment.
//!
//! Implements [`WorkflowEnvironment`] with a virtual clock and a
//! callback-queue main loop: timers auto-fire by advancing mock time
//! (or by real wall time while activities are running), activities run
//! as background tasks, and child workflows get their own nested
//! environment sharing the parent's registrations, mocks, and
//! overrides. Workflows under test execute deterministically and
//! without real waiting.

mod clock;
mod mocks;

pub use mocks::ActivityInfo;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatcher::panic_message;
use crate::driver::WorkflowDriver;
use crate::env::{
    ActivityId, ExecuteActivityParams, ExecuteChildWorkflowParams, ResultHandler,
    SideEffectProducer, StartedHandler, TimerId, Version, WorkflowEnvironment, WorkflowExecution,
    WorkflowInfo, WorkflowType,
};
use crate::error::WorkflowError;
use crate::registry::{
    typed_activity_handler, typed_workflow_handler, ActivityRegistry, FnWorkflow, WorkflowHandler,
    WorkflowRegistry,
};
use crate::EncodedValue;
use clock::MockClock;
use mocks::{Listeners, MockResponders, Overrides};

const DEFAULT_TEST_TASK_LIST: &str = "default-test-tasklist";
const DEFAULT_TEST_WORKFLOW_ID: &str = "default-test-workflow-id";
const DEFAULT_TEST_RUN_ID: &str = "default-test-run-id";
const DEFAULT_TEST_DOMAIN: &str = "default-test-domain";
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) fn validate_version(
    change_id: &str,
    recorded: Version,
    min_supported: Version,
    max_supported: Version,
) -> Result<(), String> {
    if recorded < min_supported {
        return Err(format!(
            "workflow code removed support of version {recorded} for change {change_id} \
             (minimum supported is {min_supported})"
        ));
    }
    if recorded > max_supported {
        return Err(format!(
            "workflow code is too old to support version {recorded} for change {change_id} \
             (maximum supported is {max_supported})"
        ));
    }
    Ok(())
}

struct CallbackHandle {
    callback: Box<dyn FnOnce() + Send>,
    /// Start a decision task after the callback runs.
    start_decision_task: bool,
}

struct TestTimerHandle {
    callback: ResultHandler,
    duration: Duration,
    mock_time_to_fire: SystemTime,
    wall_time_to_fire: Option<tokio::time::Instant>,
    wall_timer: Option<tokio::task::JoinHandle<()>>,
    id: u64,
}

struct TestActivityHandle {
    callback: ResultHandler,
    activity_type: String,
}

struct ChildWorkflowHandle {
    env: Arc<TestEnvCore>,
}

struct TestEnvCore {
    me: Weak<TestEnvCore>,
    parent: Option<Weak<TestEnvCore>>,

    workflow_info: Mutex<WorkflowInfo>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    mocks: Arc<MockResponders>,
    overrides: Arc<Overrides>,
    listeners: Listeners,

    clock: MockClock,
    counter: AtomicU64,
    running_count: AtomicI64,

    callback_tx: mpsc::UnboundedSender<CallbackHandle>,
    callback_rx: Mutex<Option<mpsc::UnboundedReceiver<CallbackHandle>>>,

    driver: Mutex<Option<WorkflowDriver>>,

    // touched from both activity tasks (heartbeats, async completion)
    // and the main loop
    activity_handles: Mutex<HashMap<String, TestActivityHandle>>,
    timers: Mutex<HashMap<String, TestTimerHandle>>,
    child_workflows: Mutex<HashMap<String, ChildWorkflowHandle>>,

    cancel_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    signal_handler: Mutex<Option<Box<dyn Fn(&str, EncodedValue) + Send + Sync>>>,

    versions: Mutex<HashMap<String, Version>>,

    test_timeout: Mutex<Duration>,
    completion: Mutex<Option<Result<EncodedValue, WorkflowError>>>,
}

impl TestEnvCore {
    fn new(
        parent: Option<Weak<TestEnvCore>>,
        workflow_info: WorkflowInfo,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        mocks: Arc<MockResponders>,
        overrides: Arc<Overrides>,
        test_timeout: Duration,
    ) -> Arc<Self> {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| TestEnvCore {
            me: me.clone(),
            parent,
            workflow_info: Mutex::new(workflow_info),
            workflows,
            activities,
            mocks,
            overrides,
            listeners: Listeners::default(),
            clock: MockClock::new(),
            counter: AtomicU64::new(0),
            running_count: AtomicI64::new(0),
            callback_tx,
            callback_rx: Mutex::new(Some(callback_rx)),
            driver: Mutex::new(None),
            activity_handles: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            child_workflows: Mutex::new(HashMap::new()),
            cancel_handler: Mutex::new(None),
            signal_handler: Mutex::new(None),
            versions: Mutex::new(HashMap::new()),
            test_timeout: Mutex::new(test_timeout),
            completion: Mutex::new(None),
        })
    }

    fn me(&self) -> Arc<TestEnvCore> {
        self.me.upgrade().expect("environment alive")
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn post_callback(&self, callback: impl FnOnce() + Send + 'static, start_decision_task: bool) {
        let _ = self.callback_tx.send(CallbackHandle {
            callback: Box::new(callback),
            start_decision_task,
        });
    }

    /// Post an empty callback that only triggers a decision task.
    fn start_decision_task(&self) {
        self.post_callback(|| {}, true);
    }

    fn is_test_completed(&self) -> bool {
        self.completion.lock().unwrap().is_some()
    }

    fn activity_info(&self, activity_id: &str, activity_type: &str) -> ActivityInfo {
        ActivityInfo {
            activity_id: ActivityId(activity_id.to_string()),
            activity_type: activity_type.to_string(),
            workflow_execution: self.workflow_info.lock().unwrap().workflow_execution.clone(),
        }
    }

    // ---------------- workflow execution

    fn resolve_workflow_handler(
        &self,
        workflow_type: &str,
        input: &EncodedValue,
    ) -> Arc<dyn WorkflowHandler> {
        if let Some(result) = self.mocks.find_workflow(workflow_type, input) {
            return Arc::new(FnWorkflow(
                move |_ctx: crate::WorkflowContext, _input: EncodedValue| {
                    let result = result.clone();
                    async move { result }
                },
            ));
        }
        if let Some(fake) = self.overrides.workflow(workflow_type) {
            return fake;
        }
        match self.workflows.get(workflow_type) {
            Some(handler) => handler,
            None => panic!("no workflow is registered with name {workflow_type}"),
        }
    }

    async fn execute_workflow_internal(self: &Arc<Self>, workflow_type: String, input: EncodedValue) {
        *self.completion.lock().unwrap() = None;
        self.workflow_info.lock().unwrap().workflow_type = WorkflowType {
            name: workflow_type.clone(),
        };
        let handler = self.resolve_workflow_handler(&workflow_type, &input);
        let driver = WorkflowDriver::new(self.me() as Arc<dyn WorkflowEnvironment>, handler, input);
        *self.driver.lock().unwrap() = Some(driver);
        self.main_loop().await;
    }

    async fn main_loop(self: &Arc<Self>) {
        let mut rx = self
            .callback_rx
            .lock()
            .unwrap()
            .take()
            .expect("workflow is already executing in this environment");
        loop {
            match rx.try_recv() {
                Ok(handle) => self.process_callback(handle),
                Err(_) => {
                    // nothing queued; check whether a timer can fire
                    if self.auto_fire_next_timer() {
                        continue;
                    }
                    if self.is_test_completed() {
                        break;
                    }
                    let timeout = *self.test_timeout.lock().unwrap();
                    match tokio::time::timeout(timeout, rx.recv()).await {
                        Ok(Some(handle)) => self.process_callback(handle),
                        Ok(None) => break,
                        Err(_) => {
                            let stack = self
                                .driver
                                .lock()
                                .unwrap()
                                .as_ref()
                                .map(|d| d.stack_trace())
                                .unwrap_or_default();
                            panic!("test timeout: {timeout:?}, workflow stack:\n{stack}");
                        }
                    }
                }
            }
        }
        *self.callback_rx.lock().unwrap() = Some(rx);
    }

    fn process_callback(&self, handle: CallbackHandle) {
        (handle.callback)();
        if handle.start_decision_task && !self.is_test_completed() {
            if let Some(driver) = self.driver.lock().unwrap().as_mut() {
                driver.on_decision_task_started();
            }
        }
    }

    // ---------------- timers

    /// Fire the earliest pending timer, ties broken by smaller id.
    /// With no running activity, mock time jumps straight to the fire
    /// time; otherwise a wall-clock timer re-enters the loop so
    /// activities on real threads get real time to finish.
    fn auto_fire_next_timer(self: &Arc<Self>) -> bool {
        let mut timers = self.timers.lock().unwrap();
        if timers.is_empty() {
            return false;
        }
        let key = timers
            .values()
            .min_by_key(|t| (t.mock_time_to_fire, t.id))
            .map(|t| t.id.to_string())
            .expect("non-empty timer map");

        if self.running_count.load(Ordering::SeqCst) == 0 {
            let handle = timers.remove(&key).expect("selected timer present");
            drop(timers);
            if let Some(wall_timer) = &handle.wall_timer {
                wall_timer.abort();
            }
            self.clock.advance_to(handle.mock_time_to_fire);
            debug!(timer_id = %key, duration = ?handle.duration, "auto fire timer");
            self.fire_timer(key, handle);
            return true;
        }

        let handle = timers.get_mut(&key).expect("selected timer present");
        let duration_to_fire = self.clock.until(handle.mock_time_to_fire);
        let wall_time_to_fire = tokio::time::Instant::now() + duration_to_fire;
        if let Some(existing) = handle.wall_time_to_fire {
            if existing <= wall_time_to_fire {
                // an earlier wall timer for this same timer is already
                // armed; keep it
                return false;
            }
        }
        if let Some(previous) = handle.wall_timer.take() {
            previous.abort();
        }
        let core = self.me();
        let timer_key = key.clone();
        handle.wall_time_to_fire = Some(wall_time_to_fire);
        handle.wall_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration_to_fire).await;
            let inner = core.clone();
            core.post_callback(
                move || {
                    // fire only if the timer was not canceled or
                    // already fired meanwhile
                    let removed = inner.timers.lock().unwrap().remove(&timer_key);
                    if let Some(handle) = removed {
                        inner.clock.advance_to(handle.mock_time_to_fire);
                        let timer_id = TimerId(timer_key.clone());
                        (handle.callback)(Ok(EncodedValue::unit()));
                        inner.listeners.notify_timer_fired(&timer_id);
                    }
                },
                true,
            );
        }));
        false
    }

    fn fire_timer(self: &Arc<Self>, key: String, handle: TestTimerHandle) {
        let core = self.me();
        self.post_callback(
            move || {
                let timer_id = TimerId(key);
                (handle.callback)(Ok(EncodedValue::unit()));
                core.listeners.notify_timer_fired(&timer_id);
            },
            true,
        );
    }

    // ---------------- activities

    async fn run_activity(
        self: Arc<Self>,
        activity_type: String,
        input: EncodedValue,
    ) -> Option<Result<EncodedValue, WorkflowError>> {
        if let Some(result) = self.mocks.find_activity(&activity_type, &input) {
            return Some(result);
        }
        let handler = match self.overrides.activity(&activity_type) {
            Some(fake) => fake,
            None => match self.activities.get(&activity_type) {
                Some(handler) => handler,
                None => {
                    // surface the misconfiguration on the main loop so
                    // the test fails with a diagnostic
                    self.post_callback(
                        move || panic!("no activity is registered with name {activity_type}"),
                        false,
                    );
                    return None;
                }
            },
        };
        // run in a separate task so an activity panic becomes a typed
        // error instead of tearing down the environment
        let result = match tokio::spawn(async move { handler.execute(input).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                Err(WorkflowError::Panic {
                    message: panic_message(payload.as_ref()),
                    stack: String::new(),
                })
            }
            Err(_) => Err(WorkflowError::Generic("activity task canceled".into())),
        };
        Some(result)
    }

    /// Runs on the main loop with an activity's outcome.
    fn handle_activity_result(
        &self,
        activity_id: String,
        result: Result<EncodedValue, WorkflowError>,
        activity_type: &str,
    ) {
        let info = self.activity_info(&activity_id, activity_type);
        if matches!(result, Err(WorkflowError::ResultPending)) {
            // activity will complete asynchronously via
            // `complete_activity`; keep its handle
            self.listeners
                .notify_activity_completed(&info, &Err(WorkflowError::ResultPending));
            return;
        }
        let handle = self.activity_handles.lock().unwrap().remove(&activity_id);
        let Some(handle) = handle else {
            debug!(%activity_id, "activity already completed or canceled");
            return;
        };
        (handle.callback)(result.clone());
        self.listeners.notify_activity_completed(&info, &result);
        self.start_decision_task();
    }
}

impl WorkflowEnvironment for TestEnvCore {
    fn workflow_info(&self) -> WorkflowInfo {
        self.workflow_info.lock().unwrap().clone()
    }

    fn complete(&self, result: Result<EncodedValue, WorkflowError>) {
        {
            let mut completion = self.completion.lock().unwrap();
            if completion.is_some() {
                debug!("workflow already completed");
                return;
            }
            let canceled = result.as_ref().is_err_and(|e| e.is_canceled());
            *completion = Some(result);
            if !canceled {
                return;
            }
        }
        if let Some(cancel_handler) = &*self.cancel_handler.lock().unwrap() {
            cancel_handler();
        }
    }

    fn execute_activity(
        &self,
        params: ExecuteActivityParams,
        callback: ResultHandler,
    ) -> ActivityId {
        let activity_id = params
            .activity_id
            .unwrap_or_else(|| self.next_id().to_string());
        let activity_type = params.activity_type.name;
        self.activity_handles.lock().unwrap().insert(
            activity_id.clone(),
            TestActivityHandle {
                callback,
                activity_type: activity_type.clone(),
            },
        );
        self.running_count.fetch_add(1, Ordering::SeqCst);

        let info = self.activity_info(&activity_id, &activity_type);
        let input = params.input;
        let core = self.me();
        let started_input = input.clone();
        let started_info = info.clone();
        let started_core = core.clone();
        self.post_callback(
            move || {
                started_core
                    .listeners
                    .notify_activity_started(&started_info, &started_input);
            },
            false,
        );

        let id_for_task = activity_id.clone();
        tokio::spawn(async move {
            let result = core.clone().run_activity(activity_type.clone(), input).await;
            if let Some(result) = result {
                let inner = core.clone();
                // do not auto-start a decision task from here; the
                // result handler posts one itself
                core.post_callback(
                    move || inner.handle_activity_result(id_for_task, result, &activity_type),
                    false,
                );
            }
            core.running_count.fetch_sub(1, Ordering::SeqCst);
        });

        ActivityId(activity_id)
    }

    fn request_cancel_activity(&self, activity_id: &ActivityId) {
        let handle = self.activity_handles.lock().unwrap().remove(&activity_id.0);
        let Some(handle) = handle else {
            debug!(activity_id = %activity_id, "cancel failed, activity not found or already completed");
            return;
        };
        let info = self.activity_info(&activity_id.0, &handle.activity_type);
        let core = self.me();
        self.post_callback(
            move || {
                (handle.callback)(Err(WorkflowError::canceled()));
                core.listeners.notify_activity_canceled(&info);
            },
            true,
        );
    }

    fn execute_child_workflow(
        &self,
        params: ExecuteChildWorkflowParams,
        callback: ResultHandler,
        started: StartedHandler,
    ) {
        let workflow_id = if params.workflow_id.is_empty() {
            let parent_run_id = self.workflow_info.lock().unwrap().workflow_execution.run_id.clone();
            format!("{parent_run_id}_{}", self.next_id())
        } else {
            params.workflow_id.clone()
        };
        let execution = WorkflowExecution {
            workflow_id: workflow_id.clone(),
            run_id: format!("{workflow_id}_RunID"),
        };
        let child_info = WorkflowInfo {
            workflow_execution: execution.clone(),
            workflow_type: params.workflow_type.clone(),
            task_list_name: params.task_list.clone(),
            execution_start_to_close_timeout: params.execution_start_to_close_timeout,
            task_start_to_close_timeout: params.task_start_to_close_timeout,
            domain: params.domain.clone(),
        };
        let child = TestEnvCore::new(
            Some(self.me.clone()),
            child_info,
            self.workflows.clone(),
            self.activities.clone(),
            self.mocks.clone(),
            self.overrides.clone(),
            *self.test_timeout.lock().unwrap(),
        );
        self.child_workflows.lock().unwrap().insert(
            workflow_id.clone(),
            ChildWorkflowHandle { env: child.clone() },
        );

        self.running_count.fetch_add(1, Ordering::SeqCst);
        started(Ok(execution.clone()));

        let core = self.me();
        let started_core = core.clone();
        let started_execution = execution.clone();
        let started_input = params.input.clone();
        self.post_callback(
            move || {
                started_core
                    .listeners
                    .notify_child_started(&started_execution, &started_input);
            },
            false,
        );

        tokio::spawn(async move {
            child
                .execute_workflow_internal(params.workflow_type.name, params.input)
                .await;
            let result = child
                .completion
                .lock()
                .unwrap()
                .clone()
                .expect("child main loop exits only after completion");
            let inner = core.clone();
            core.post_callback(
                move || {
                    inner.child_workflows.lock().unwrap().remove(&workflow_id);
                    callback(result.clone());
                    inner.listeners.notify_child_completed(&execution, &result);
                },
                true,
            );
            core.running_count.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn request_cancel_workflow(&self, _domain: &str, workflow_id: &str, _run_id: &str) {
        let own_id = self
            .workflow_info
            .lock()
            .unwrap()
            .workflow_execution
            .workflow_id
            .clone();
        if own_id == workflow_id {
            // cancel the workflow running in this environment
            if let Some(cancel_handler) = &*self.cancel_handler.lock().unwrap() {
                cancel_handler();
            }
            if let Some(parent) = self.parent.as_ref().and_then(|p| p.upgrade()) {
                let execution = self.workflow_info.lock().unwrap().workflow_execution.clone();
                let parent_inner = parent.clone();
                parent.post_callback(
                    move || parent_inner.listeners.notify_child_canceled(&execution),
                    false,
                );
            }
        } else if let Some(handle) = self.child_workflows.lock().unwrap().remove(workflow_id) {
            // this workflow is the parent, canceling one of its children
            let child = handle.env;
            let child_inner = child.clone();
            child.post_callback(
                move || {
                    let info = child_inner.workflow_info.lock().unwrap().clone();
                    child_inner.request_cancel_workflow(
                        &info.domain,
                        &info.workflow_execution.workflow_id,
                        &info.workflow_execution.run_id,
                    );
                },
                true,
            );
        } else {
            warn!(workflow_id, "request_cancel_workflow: unknown workflow");
        }
    }

    fn new_timer(&self, duration: Duration, callback: ResultHandler) -> Option<TimerId> {
        let id = self.next_id();
        let timer_id = TimerId(id.to_string());
        self.timers.lock().unwrap().insert(
            id.to_string(),
            TestTimerHandle {
                callback,
                duration,
                mock_time_to_fire: self.clock.now() + duration,
                wall_time_to_fire: None,
                wall_timer: None,
                id,
            },
        );
        self.listeners.notify_timer_scheduled(&timer_id, duration);
        Some(timer_id)
    }

    fn request_cancel_timer(&self, timer_id: &TimerId) {
        let handle = self.timers.lock().unwrap().remove(&timer_id.0);
        let Some(handle) = handle else {
            debug!(timer_id = %timer_id, "cancel failed, timer not found");
            return;
        };
        if let Some(wall_timer) = &handle.wall_timer {
            wall_timer.abort();
        }
        let core = self.me();
        let timer_id = timer_id.clone();
        self.post_callback(
            move || {
                (handle.callback)(Err(WorkflowError::canceled()));
                core.listeners.notify_timer_canceled(&timer_id);
            },
            true,
        );
    }

    fn side_effect(&self, producer: SideEffectProducer, callback: ResultHandler) {
        callback(producer());
    }

    fn get_version(&self, change_id: &str, min_supported: Version, max_supported: Version) -> Version {
        let mut versions = self.versions.lock().unwrap();
        match versions.get(change_id) {
            Some(&recorded) => {
                if let Err(msg) = validate_version(change_id, recorded, min_supported, max_supported)
                {
                    panic!("{msg}");
                }
                recorded
            }
            None => {
                versions.insert(change_id.to_string(), max_supported);
                max_supported
            }
        }
    }

    fn register_cancel_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.cancel_handler.lock().unwrap() = Some(handler);
    }

    fn register_signal_handler(&self, handler: Box<dyn Fn(&str, EncodedValue) + Send + Sync>) {
        *self.signal_handler.lock().unwrap() = Some(handler);
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }
}

/// Test environment for one workflow execution.
///
/// Configure registrations, mocks, overrides, and listeners, then call
/// [`TestWorkflowEnvironment::execute_workflow`]; it drives the
/// workflow to completion over virtual time and returns its result.
pub struct TestWorkflowEnvironment {
    core: Arc<TestEnvCore>,
}

impl Clone for TestWorkflowEnvironment {
    fn clone(&self) -> Self {
        TestWorkflowEnvironment {
            core: self.core.clone(),
        }
    }
}

impl Default for TestWorkflowEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorkflowEnvironment {
    pub fn new() -> Self {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();
        let info = WorkflowInfo {
            workflow_execution: WorkflowExecution {
                workflow_id: DEFAULT_TEST_WORKFLOW_ID.to_string(),
                run_id: DEFAULT_TEST_RUN_ID.to_string(),
            },
            workflow_type: WorkflowType {
                name: "workflow-type-not-specified".to_string(),
            },
            task_list_name: DEFAULT_TEST_TASK_LIST.to_string(),
            execution_start_to_close_timeout: Duration::from_secs(1),
            task_start_to_close_timeout: Duration::from_secs(1),
            domain: DEFAULT_TEST_DOMAIN.to_string(),
        };
        TestWorkflowEnvironment {
            core: TestEnvCore::new(
                None,
                info,
                WorkflowRegistry::new(),
                ActivityRegistry::new(),
                Arc::new(MockResponders::default()),
                Arc::new(Overrides::default()),
                DEFAULT_TEST_TIMEOUT,
            ),
        }
    }

    // ---------------- registration

    pub fn register_workflow<In, Out, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(crate::WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.core.workflows.register_typed(name, f);
    }

    pub fn register_activity<In, Out, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.core.activities.register_typed(name, f);
    }

    /// Substitute a fake implementation for a workflow, keeping the
    /// real one registered.
    pub fn override_workflow<In, Out, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(crate::WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.core
            .overrides
            .set_workflow(name.into(), typed_workflow_handler(f));
    }

    /// Substitute a fake implementation for an activity.
    pub fn override_activity<In, Out, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.core
            .overrides
            .set_activity(name.into(), typed_activity_handler(f));
    }

    /// Mock an activity result, matched by name and (optionally)
    /// arguments. Panics with a diagnostic when the mock itself cannot
    /// be encoded.
    pub fn mock_activity_result<Args, Out>(
        &self,
        name: impl Into<String>,
        args: Option<Args>,
        result: Result<Out, WorkflowError>,
    ) where
        Args: Serialize,
        Out: Serialize,
    {
        let name = name.into();
        let args = args.map(|a| {
            EncodedValue::encode(&a)
                .unwrap_or_else(|e| panic!("mock of {name} has unencodable arguments: {e}"))
        });
        let result = result.map(|r| {
            EncodedValue::encode(&r)
                .unwrap_or_else(|e| panic!("mock of {name} has unencodable return value: {e}"))
        });
        self.core.mocks.add_activity(name, args, result);
    }

    /// Mock a workflow result, matched by name and (optionally)
    /// arguments. Child workflows consult the same mock table.
    pub fn mock_workflow_result<Args, Out>(
        &self,
        name: impl Into<String>,
        args: Option<Args>,
        result: Result<Out, WorkflowError>,
    ) where
        Args: Serialize,
        Out: Serialize,
    {
        let name = name.into();
        let args = args.map(|a| {
            EncodedValue::encode(&a)
                .unwrap_or_else(|e| panic!("mock of {name} has unencodable arguments: {e}"))
        });
        let result = result.map(|r| {
            EncodedValue::encode(&r)
                .unwrap_or_else(|e| panic!("mock of {name} has unencodable return value: {e}"))
        });
        self.core.mocks.add_workflow(name, args, result);
    }

    /// Wall-clock budget for a stuck workflow before the environment
    /// panics with a stack dump. Default 3 seconds.
    pub fn set_test_timeout(&self, timeout: Duration) {
        *self.core.test_timeout.lock().unwrap() = timeout;
    }

    // ---------------- execution

    /// Execute a registered workflow to completion over virtual time.
    pub async fn execute_workflow<Args: Serialize>(
        &self,
        workflow_type: &str,
        args: Args,
    ) -> Result<EncodedValue, WorkflowError> {
        let input = EncodedValue::encode(&args)?;
        self.core
            .execute_workflow_internal(workflow_type.to_string(), input)
            .await;
        self.workflow_result()
            .expect("main loop exits only after completion")
    }

    /// Execute a workflow function, registering it under `name` first
    /// if no workflow with that name exists yet.
    pub async fn execute_workflow_fn<Args, In, Out, F, Fut>(
        &self,
        name: &str,
        f: F,
        args: Args,
    ) -> Result<EncodedValue, WorkflowError>
    where
        Args: Serialize,
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(crate::WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.core
            .workflows
            .register_if_absent(name, typed_workflow_handler(f));
        self.execute_workflow(name, args).await
    }

    /// Execute a registered activity directly, without a workflow.
    pub async fn execute_activity<Args: Serialize>(
        &self,
        activity_type: &str,
        args: Args,
    ) -> Result<EncodedValue, WorkflowError> {
        let input = EncodedValue::encode(&args)?;
        let core = self.core.clone();
        core.clone()
            .run_activity(activity_type.to_string(), input)
            .await
            .unwrap_or_else(|| panic!("no activity is registered with name {activity_type}"))
    }

    pub fn is_workflow_completed(&self) -> bool {
        self.core.is_test_completed()
    }

    /// Result of the completed workflow, `None` while still running.
    pub fn workflow_result(&self) -> Option<Result<EncodedValue, WorkflowError>> {
        self.core.completion.lock().unwrap().clone()
    }

    // ---------------- interaction

    /// Deliver a signal to the running workflow. May be called before
    /// `execute_workflow`; delivery happens once the workflow starts.
    pub fn signal_workflow<T: Serialize>(&self, name: &str, value: T) {
        let data = EncodedValue::encode(&value).expect("signal payload must be serializable");
        let core = self.core.clone();
        let name = name.to_string();
        self.core.post_callback(
            move || {
                let handler = core.signal_handler.lock().unwrap();
                let handler = handler.as_ref().expect("signal handler registered");
                handler(&name, data);
            },
            true,
        );
    }

    /// Run `f` after `delay` of virtual time, e.g. to deliver a signal
    /// mid-workflow.
    pub fn register_delayed_callback(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let core = self.core.clone();
        self.core.post_callback(
            move || {
                WorkflowEnvironment::new_timer(
                    &*core,
                    delay,
                    Box::new(move |result| {
                        if result.is_ok() {
                            f();
                        }
                    }),
                );
            },
            true,
        );
    }

    /// Request cancellation of the workflow under test.
    pub fn cancel_workflow(&self) {
        let core = self.core.clone();
        self.core.post_callback(
            move || {
                let info = core.workflow_info.lock().unwrap().clone();
                core.request_cancel_workflow(
                    &info.domain,
                    &info.workflow_execution.workflow_id,
                    &info.workflow_execution.run_id,
                );
            },
            true,
        );
    }

    /// Query the workflow. The handler runs outside the dispatcher.
    pub fn query_workflow<Args, Out>(&self, query_type: &str, args: Args) -> Result<Out, WorkflowError>
    where
        Args: Serialize,
        Out: DeserializeOwned,
    {
        let encoded = EncodedValue::encode(&args)?;
        let driver = self.core.driver.lock().unwrap();
        let Some(driver) = driver.as_ref() else {
            return Err(WorkflowError::Generic("workflow has not started".into()));
        };
        driver.query(query_type, encoded)?.get()
    }

    /// Complete an activity that returned the result-pending sentinel.
    pub fn complete_activity<T: Serialize>(
        &self,
        activity_id: &str,
        result: Result<T, WorkflowError>,
    ) {
        let result = match result {
            Ok(v) => EncodedValue::encode(&v),
            Err(e) => Err(e),
        };
        let core = self.core.clone();
        let activity_id = activity_id.to_string();
        self.core.post_callback(
            move || {
                let activity_type = match core.activity_handles.lock().unwrap().get(&activity_id) {
                    Some(handle) => handle.activity_type.clone(),
                    None => {
                        debug!(%activity_id, "complete_activity: activity not found");
                        return;
                    }
                };
                core.handle_activity_result(activity_id, result, &activity_type);
            },
            false,
        );
    }

    /// Record a heartbeat for a running activity, driving the
    /// heartbeat listener. Safe to call from activity code.
    pub fn record_activity_heartbeat<T: Serialize>(&self, activity_id: &str, details: T) {
        let details = EncodedValue::encode(&details).expect("heartbeat details must be serializable");
        let handles = self.core.activity_handles.lock().unwrap();
        let Some(handle) = handles.get(activity_id) else {
            debug!(%activity_id, "heartbeat: activity not found, could be already completed");
            return;
        };
        let info = self.core.activity_info(activity_id, &handle.activity_type);
        drop(handles);
        let core = self.core.clone();
        self.core.post_callback(
            move || core.listeners.notify_activity_heartbeat(&info, &details),
            false,
        );
    }

    // ---------------- listeners

    pub fn set_on_activity_started_listener(
        &self,
        f: impl Fn(&ActivityInfo, &EncodedValue) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_activity_started.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_activity_completed_listener(
        &self,
        f: impl Fn(&ActivityInfo, &Result<EncodedValue, WorkflowError>) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_activity_completed.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_activity_canceled_listener(
        &self,
        f: impl Fn(&ActivityInfo) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_activity_canceled.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_activity_heartbeat_listener(
        &self,
        f: impl Fn(&ActivityInfo, &EncodedValue) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_activity_heartbeat.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_child_workflow_started_listener(
        &self,
        f: impl Fn(&WorkflowExecution, &EncodedValue) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_child_workflow_started.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_child_workflow_completed_listener(
        &self,
        f: impl Fn(&WorkflowExecution, &Result<EncodedValue, WorkflowError>) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_child_workflow_completed.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_child_workflow_canceled_listener(
        &self,
        f: impl Fn(&WorkflowExecution) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_child_workflow_canceled.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_timer_scheduled_listener(
        &self,
        f: impl Fn(&TimerId, Duration) + Send + Sync + 'static,
    ) {
        *self.core.listeners.on_timer_scheduled.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_timer_fired_listener(&self, f: impl Fn(&TimerId) + Send + Sync + 'static) {
        *self.core.listeners.on_timer_fired.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_timer_canceled_listener(&self, f: impl Fn(&TimerId) + Send + Sync + 'static) {
        *self.core.listeners.on_timer_canceled.lock().unwrap() = Some(Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_validation_accepts_in_range_and_rejects_outside() {
        assert!(validate_version("change", 2, 1, 3).is_ok());
        assert!(validate_version("change", 2, 2, 2).is_ok());
        let too_old = validate_version("change", 0, 1, 3).unwrap_err();
        assert!(too_old.contains("removed support"), "{too_old}");
        let too_new = validate_version("change", 4, 1, 3).unwrap_err();
        assert!(too_new.contains("too old"), "{too_new}");
    }
}
