//! Drives one workflow execution: builds the root context, spawns the
//! user workflow coroutine, pumps the dispatcher on each decision
//! start, and reports completion to the environment.

use std::sync::Arc;

use tracing::{error, warn};

use crate::context::{ResultCell, WorkflowContext};
use crate::dispatcher::{panic_message, Dispatcher};
use crate::env::WorkflowEnvironment;
use crate::error::WorkflowError;
use crate::registry::WorkflowHandler;
use crate::EncodedValue;

/// One workflow execution coupled to an environment.
pub struct WorkflowDriver {
    dispatcher: Dispatcher,
    root_ctx: WorkflowContext,
    result: ResultCell,
}

impl WorkflowDriver {
    /// Wire a workflow function into a fresh dispatcher and register
    /// the cancel and signal handlers with the environment. Pumps the
    /// dispatcher once so that state needed before the first decision
    /// task (signal channels, the cancel scope) exists.
    pub fn new(
        env: Arc<dyn WorkflowEnvironment>,
        handler: Arc<dyn WorkflowHandler>,
        input: EncodedValue,
    ) -> Self {
        let (ctx, result) = WorkflowContext::new_root(env.clone());
        let info = env.workflow_info();
        let ctx = ctx
            .with_workflow_domain(info.domain)
            .with_workflow_task_list(info.task_list_name)
            .with_execution_start_to_close_timeout(info.execution_start_to_close_timeout)
            .with_workflow_task_start_to_close_timeout(info.task_start_to_close_timeout);
        let (root_ctx, cancel) = ctx.with_cancel();

        let dispatcher = Dispatcher::new(&root_ctx, move |ctx| async move {
            // Execute user code only from the first decision task
            // start, so everything delivered before it (signals,
            // cancellation) is observable when the code begins.
            let state = ctx.coroutine_state().clone();
            state
                .yield_now("yield before executing to setup state".into())
                .await;
            let output = handler.execute(ctx.clone(), input).await;
            *ctx.result_cell().lock().unwrap() = Some(output);
        });

        // Repeated cancels are fine, the context stays canceled.
        env.register_cancel_handler(Box::new(move || cancel.cancel()));

        let options = root_ctx
            .options()
            .expect("root context carries workflow options")
            .clone();
        env.register_signal_handler(Box::new(move |name, payload| {
            let ch = options.lock().unwrap().signal_channel(name);
            // must never block here; an exhausted buffer means the
            // workflow is ignoring its signals
            if !ch.send_async(payload) {
                panic!("exceeded signal channel buffer size for signal: {name}");
            }
        }));

        let mut driver = WorkflowDriver {
            dispatcher,
            root_ctx,
            result,
        };
        driver.execute_dispatcher();
        driver
    }

    /// Pump the dispatcher in response to a decision task start.
    pub fn on_decision_task_started(&mut self) {
        self.execute_dispatcher();
    }

    fn execute_dispatcher(&mut self) {
        if let Err(panic_err) = self.dispatcher.execute_until_all_blocked() {
            error!(
                error = %panic_err,
                stack = %panic_err.stack_trace(),
                "workflow dispatcher panic; failing the decision, not the workflow"
            );
            self.warn_unhandled_signals();
            // The decision is failed and retried by the environment
            // after its timeout; workflow state is preserved.
            return;
        }
        let result = self.result.lock().unwrap().clone();
        let Some(result) = result else {
            return; // workflow is still executing
        };
        self.warn_unhandled_signals();
        self.root_ctx.env().complete(result);
    }

    fn warn_unhandled_signals(&self) {
        if let Some(options) = self.root_ctx.options() {
            let unhandled = options.lock().unwrap().unhandled_signals();
            if !unhandled.is_empty() {
                warn!(signal_names = ?unhandled, "workflow has unhandled signals");
            }
        }
    }

    /// Answer a query against current workflow state. The handler runs
    /// outside the dispatcher; a panicking handler fails the query,
    /// never the workflow.
    pub fn query(&self, query_type: &str, args: EncodedValue) -> Result<EncodedValue, WorkflowError> {
        let handler = self
            .root_ctx
            .options()
            .and_then(|o| o.lock().unwrap().query_handlers.get(query_type).cloned());
        let Some(handler) = handler else {
            return Err(WorkflowError::Generic(format!(
                "unknown query type: {query_type}"
            )));
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (*handler)(args))) {
            Ok(result) => result,
            Err(payload) => Err(WorkflowError::Generic(format!(
                "query handler panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    /// True once the workflow function has returned.
    pub fn is_complete(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }

    /// Yield-point report of every live coroutine.
    pub fn stack_trace(&self) -> String {
        self.dispatcher.stack_trace()
    }

    /// Destroy all coroutines without waiting for their completion.
    pub fn close(&mut self) {
        self.dispatcher.close();
    }
}
