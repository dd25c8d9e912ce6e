//! Workflow operation surface, exposed as methods on
//! [`WorkflowContext`].
//!
//! Each operation validates its input (bad input materializes as a
//! pre-failed future), submits to the environment with a callback that
//! settles the returned future, and spawns a coroutine that watches
//! context cancellation to issue the matching external cancel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::channel::Channel;
use crate::context::{QueryHandler, WorkflowContext};
use crate::env::{
    ActivityType, ExecuteActivityParams, ExecuteChildWorkflowParams, SideEffectProducer, Version,
    WorkflowType,
};
use crate::error::WorkflowError;
use crate::future::{new_future_pair, ChildWorkflowFuture, DecodedFuture, Settable, WorkflowFuture};
use crate::selector::Selector;
use crate::EncodedValue;

const DEFAULT_TASK_START_TO_CLOSE: Duration = Duration::from_secs(10);

impl WorkflowContext {
    // ---------------- primitives

    /// Create an unbuffered channel with an auto-assigned name.
    pub fn new_channel<T: Send + 'static>(&self) -> Channel<T> {
        Channel::new(self.next_channel_name(), 0)
    }

    /// Create an unbuffered channel with a human readable name. The
    /// name appears in stack reports of coroutines blocked on it.
    pub fn new_named_channel<T: Send + 'static>(&self, name: impl Into<String>) -> Channel<T> {
        Channel::new(name, 0)
    }

    pub fn new_buffered_channel<T: Send + 'static>(&self, size: usize) -> Channel<T> {
        Channel::new(self.next_channel_name(), size)
    }

    pub fn new_named_buffered_channel<T: Send + 'static>(
        &self,
        name: impl Into<String>,
        size: usize,
    ) -> Channel<T> {
        Channel::new(name, size)
    }

    pub fn new_selector(&self) -> Selector {
        Selector::new(self.next_selector_name())
    }

    pub fn new_named_selector(&self, name: impl Into<String>) -> Selector {
        Selector::new(name)
    }

    /// Create a future together with the settable that resolves it.
    pub fn new_future<T: Clone + Send + 'static>(&self) -> (WorkflowFuture<T>, Settable<T>) {
        new_future_pair(self)
    }

    /// Start a new coroutine. It has goroutine-like semantics within
    /// the workflow: deterministically scheduled, cooperative, and
    /// only able to block on workflow primitives.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.coroutine_state().dispatcher().spawn(self, None, f);
    }

    /// Like [`WorkflowContext::spawn`] with a human readable name.
    pub fn spawn_named<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.coroutine_state()
            .dispatcher()
            .spawn(self, Some(name.into()), f);
    }

    // ---------------- activities

    /// Request activity execution. The future resolves to the
    /// activity's result decoded into the requested type; failures
    /// arrive as `Custom`, `Timeout`, `Canceled`, `Panic`, or
    /// `Generic` errors. Canceling the context requests cancellation
    /// of the activity.
    pub fn execute_activity(
        &self,
        activity: impl Into<String>,
        args: impl Serialize,
    ) -> DecodedFuture {
        let (future, settable) = DecodedFuture::new(self);
        let input = match EncodedValue::encode(&args) {
            Ok(input) => input,
            Err(e) => {
                settable.set_error(e);
                return future;
            }
        };
        let params = match self.validated_activity_params(activity.into(), input) {
            Ok(params) => params,
            Err(e) => {
                settable.set_error(e);
                return future;
            }
        };
        let on_result = settable.clone();
        let activity_id = self
            .env()
            .execute_activity(params, Box::new(move |r| on_result.set(r)));
        let env = Arc::clone(self.env());
        self.spawn(move |ctx| async move {
            let Some(done) = ctx.done() else {
                return; // not cancelable
            };
            done.receive(&ctx).await;
            if ctx.err().is_some_and(|e| e.is_canceled()) {
                env.request_cancel_activity(&activity_id);
            }
        });
        future
    }

    fn validated_activity_params(
        &self,
        activity: String,
        input: EncodedValue,
    ) -> Result<ExecuteActivityParams, WorkflowError> {
        let Some(options) = self.activity_options() else {
            return Err(WorkflowError::Generic(
                "missing activity options through context, check with_activity_options".into(),
            ));
        };
        let options = options.lock().unwrap().clone();
        if options.schedule_to_start_timeout.is_zero() {
            return Err(WorkflowError::Generic(
                "missing schedule-to-start timeout in activity options".into(),
            ));
        }
        if options.start_to_close_timeout.is_zero() {
            return Err(WorkflowError::Generic(
                "missing start-to-close timeout in activity options".into(),
            ));
        }
        let info = self.workflow_info();
        let task_list = if options.task_list.is_empty() {
            info.task_list_name
        } else {
            options.task_list
        };
        let schedule_to_close = if options.schedule_to_close_timeout.is_zero() {
            options.schedule_to_start_timeout + options.start_to_close_timeout
        } else {
            options.schedule_to_close_timeout
        };
        Ok(ExecuteActivityParams {
            activity_type: ActivityType { name: activity },
            input,
            task_list,
            schedule_to_close_timeout: schedule_to_close,
            schedule_to_start_timeout: options.schedule_to_start_timeout,
            start_to_close_timeout: options.start_to_close_timeout,
            heartbeat_timeout: options.heartbeat_timeout,
            wait_for_cancellation: options.wait_for_cancellation,
            activity_id: if options.activity_id.is_empty() {
                None
            } else {
                Some(options.activity_id)
            },
        })
    }

    // ---------------- child workflows

    /// Request child workflow execution. In addition to the result
    /// future, the returned handle exposes an execution future that
    /// resolves once the child has started. Canceling the context
    /// requests cancellation of the child, but only after the child
    /// has started (a cancel racing ahead of the start is dropped).
    pub fn execute_child_workflow(
        &self,
        workflow: impl Into<String>,
        args: impl Serialize,
    ) -> ChildWorkflowFuture {
        let (result, result_settable) = DecodedFuture::new(self);
        let (execution, execution_settable) = new_future_pair(self);
        let child = ChildWorkflowFuture {
            result,
            execution: execution.clone(),
        };
        let input = match EncodedValue::encode(&args) {
            Ok(input) => input,
            Err(e) => {
                result_settable.set_error(e);
                return child;
            }
        };
        let params = match self.validated_child_workflow_params(workflow.into(), input) {
            Ok(params) => params,
            Err(e) => {
                result_settable.set_error(e);
                return child;
            }
        };
        let domain = params.domain.clone();
        let on_result = result_settable.clone();
        self.env().execute_child_workflow(
            params,
            Box::new(move |r| on_result.set(r)),
            Box::new(move |started| execution_settable.set(started)),
        );
        let env = Arc::clone(self.env());
        self.spawn(move |ctx| async move {
            let Some(done) = ctx.done() else {
                return; // not cancelable
            };
            done.receive(&ctx).await;
            if ctx.err().is_some_and(|e| e.is_canceled()) {
                if let Some(Ok(execution)) = execution.value_and_error() {
                    env.request_cancel_workflow(
                        &domain,
                        &execution.workflow_id,
                        &execution.run_id,
                    );
                }
            }
        });
        child
    }

    fn validated_child_workflow_params(
        &self,
        workflow: String,
        input: EncodedValue,
    ) -> Result<ExecuteChildWorkflowParams, WorkflowError> {
        let Some(options) = self.options() else {
            return Err(WorkflowError::Generic(
                "missing workflow options through context, check with_child_workflow_options"
                    .into(),
            ));
        };
        let info = self.workflow_info();
        let o = options.lock().unwrap();
        let domain = match &o.domain {
            Some(d) if !d.is_empty() => d.clone(),
            _ => info.domain.clone(),
        };
        let task_list = match &o.task_list_name {
            Some(t) if !t.is_empty() => t.clone(),
            _ => info.task_list_name.clone(),
        };
        let execution_timeout = match o.execution_start_to_close_timeout {
            Some(d) if !d.is_zero() => d,
            _ => {
                return Err(WorkflowError::Generic(
                    "missing or invalid execution start-to-close timeout in workflow options"
                        .into(),
                ))
            }
        };
        let task_timeout = match o.task_start_to_close_timeout {
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_TASK_START_TO_CLOSE,
        };
        Ok(ExecuteChildWorkflowParams {
            workflow_type: WorkflowType { name: workflow },
            input,
            domain,
            task_list,
            workflow_id: o.workflow_id.clone(),
            execution_start_to_close_timeout: execution_timeout,
            task_start_to_close_timeout: task_timeout,
            child_policy: o.child_policy,
            wait_for_cancellation: o.wait_for_cancellation,
        })
    }

    // ---------------- timers

    /// The future becomes ready after `d` of workflow time. A zero
    /// duration resolves immediately with success. Canceling the
    /// context cancels the pending timer.
    pub fn new_timer(&self, d: Duration) -> WorkflowFuture<()> {
        let (future, settable) = new_future_pair::<()>(self);
        if d.is_zero() {
            settable.set_value(());
            return future;
        }
        let on_fire = settable.clone();
        let timer_id = self.env().new_timer(
            d,
            Box::new(move |r| match r {
                Ok(_) => on_fire.set_value(()),
                Err(e) => on_fire.set_error(e),
            }),
        );
        if let Some(timer_id) = timer_id {
            let env = Arc::clone(self.env());
            self.spawn(move |ctx| async move {
                let Some(done) = ctx.done() else {
                    return; // not cancelable
                };
                // cancel the timer on explicit cancellation or close
                done.receive(&ctx).await;
                env.request_cancel_timer(&timer_id);
            });
        }
        future
    }

    /// Pause the coroutine for at least `d` of workflow time.
    pub async fn sleep(&self, d: Duration) -> Result<(), WorkflowError> {
        self.new_timer(d).get(self).await
    }

    // ---------------- side effects

    /// Execute `f` once, record its encoded result, and return the
    /// recorded bytes on replay without re-running `f`. Consume the
    /// value only through the returned handle; leaking data out of
    /// `f` through captured variables breaks determinism.
    pub async fn side_effect<T, F>(&self, f: F) -> EncodedValue
    where
        T: Serialize,
        F: FnOnce(&WorkflowContext) -> T + Send + 'static,
    {
        let (future, settable) = new_future_pair::<EncodedValue>(self);
        let producer_ctx = self.clone();
        let producer: SideEffectProducer = Box::new(move || {
            let value = f(&producer_ctx);
            EncodedValue::encode(&value)
        });
        let on_result = settable.clone();
        self.env()
            .side_effect(producer, Box::new(move |r| on_result.set(r)));
        match future.get(self).await {
            Ok(encoded) => encoded,
            Err(e) => panic!("side_effect failed: {e}"),
        }
    }

    // ---------------- versions

    /// Record (on first execution) or replay the change version for
    /// `change_id`. See [`crate::DEFAULT_VERSION`] for pre-versioning
    /// code.
    pub fn get_version(
        &self,
        change_id: &str,
        min_supported: Version,
        max_supported: Version,
    ) -> Version {
        self.env().get_version(change_id, min_supported, max_supported)
    }

    // ---------------- signals

    /// Channel delivering signals of the given name, in arrival
    /// order. Signals received before the first call are retained.
    pub fn get_signal_channel(&self, signal_name: &str) -> Channel<EncodedValue> {
        self.options()
            .expect("not a workflow context: no workflow options attached")
            .lock()
            .unwrap()
            .signal_channel(signal_name)
    }

    // ---------------- queries

    /// Register a query responder. Handlers run outside the
    /// dispatcher and must not call any workflow primitive. Query
    /// types starting with `__` are reserved.
    pub fn set_query_handler<In, Out, F>(
        &self,
        query_type: &str,
        handler: F,
    ) -> Result<(), WorkflowError>
    where
        In: DeserializeOwned,
        Out: Serialize,
        F: Fn(In) -> Result<Out, WorkflowError> + Send + Sync + 'static,
    {
        if query_type.starts_with("__") {
            return Err(WorkflowError::Generic(
                "query types starting with '__' are reserved for internal use".into(),
            ));
        }
        let wrapped: QueryHandler = Arc::new(move |input: EncodedValue| {
            let input: In = input.get()?;
            let out = handler(input)?;
            EncodedValue::encode(&out)
        });
        self.options()
            .expect("not a workflow context: no workflow options attached")
            .lock()
            .unwrap()
            .query_handlers
            .insert(query_type.to_string(), wrapped);
        Ok(())
    }

    // ---------------- external cancellation

    /// Request cancellation of an external workflow. Requires a
    /// domain in scope (see
    /// [`WorkflowContext::with_workflow_domain`]).
    pub fn request_cancel_workflow(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<(), WorkflowError> {
        let domain = self
            .options()
            .and_then(|o| o.lock().unwrap().domain.clone());
        let Some(domain) = domain else {
            return Err(WorkflowError::Generic(
                "a valid domain is required to cancel an external workflow".into(),
            ));
        };
        self.env().request_cancel_workflow(&domain, workflow_id, run_id);
        Ok(())
    }
}
