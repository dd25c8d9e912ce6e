use std::sync::{Arc, Mutex};
use std::time::Duration;

use syncflow::{TestWorkflowEnvironment, WorkflowContext, WorkflowError};

// Plain completion: the workflow function's return value is the
// encoded workflow result.
#[tokio::test]
async fn workflow_result_round_trips() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("Echo", |_ctx: WorkflowContext, (msg,): (String,)| async move {
        Ok::<_, WorkflowError>(format!("echo: {msg}"))
    });

    let result = env.execute_workflow("Echo", ("ping",)).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "echo: ping");
    assert!(env.is_workflow_completed());
    assert!(env.workflow_result().unwrap().is_ok());
}

// A workflow error propagates as the workflow failure.
#[tokio::test]
async fn workflow_failure_propagates() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("AlwaysFails", |_ctx: WorkflowContext, (): ()| async move {
        Err::<String, _>(WorkflowError::custom("boom"))
    });

    let err = env.execute_workflow("AlwaysFails", ()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Custom { .. }), "got {err}");
}

#[tokio::test]
#[should_panic(expected = "no workflow is registered")]
async fn executing_unregistered_workflow_panics() {
    let env = TestWorkflowEnvironment::new();
    let _ = env.execute_workflow("Missing", ()).await;
}

// A workflow function passed with its name is registered on first use.
#[tokio::test]
async fn execute_workflow_fn_auto_registers() {
    let env = TestWorkflowEnvironment::new();
    let result = env
        .execute_workflow_fn(
            "Inline",
            |_ctx: WorkflowContext, (n,): (u32,)| async move { Ok::<_, WorkflowError>(n + 1) },
            (41u32,),
        )
        .await
        .unwrap();
    assert_eq!(result.get::<u32>().unwrap(), 42);

    // second execution reuses the registration
    let again = env
        .execute_workflow_fn(
            "Inline",
            |_ctx: WorkflowContext, (n,): (u32,)| async move { Ok::<_, WorkflowError>(n + 1) },
            (1u32,),
        )
        .await
        .unwrap();
    assert_eq!(again.get::<u32>().unwrap(), 2);
}

// Signals delivered before the channel is asked for are retained in
// arrival order.
#[tokio::test]
async fn buffered_signals_arrive_in_order() {
    let env = TestWorkflowEnvironment::new();
    env.signal_workflow("numbers", 1);
    env.signal_workflow("numbers", 2);
    env.signal_workflow("numbers", 3);
    env.register_workflow("DrainSignals", |ctx: WorkflowContext, (): ()| async move {
        let ch = ctx.get_signal_channel("numbers");
        let mut seen = Vec::new();
        for _ in 0..3 {
            let payload = ch.receive(&ctx).await.expect("signal payload");
            seen.push(payload.get::<i32>()?);
        }
        Ok::<_, WorkflowError>(seen)
    });

    let result = env.execute_workflow("DrainSignals", ()).await.unwrap();
    assert_eq!(result.get::<Vec<i32>>().unwrap(), vec![1, 2, 3]);
}

// Queries run against current workflow state, outside the dispatcher.
#[tokio::test]
async fn query_handler_reflects_workflow_progress() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("Queryable", |ctx: WorkflowContext, (): ()| async move {
        let state = Arc::new(Mutex::new("started".to_string()));
        let for_query = state.clone();
        ctx.set_query_handler("current_state", move |(): ()| {
            Ok::<_, WorkflowError>(for_query.lock().unwrap().clone())
        })?;
        *state.lock().unwrap() = "waiting-timer".to_string();
        ctx.sleep(Duration::from_secs(1)).await?;
        *state.lock().unwrap() = "done".to_string();
        Ok::<_, WorkflowError>(())
    });

    env.execute_workflow("Queryable", ()).await.unwrap();
    let state: String = env.query_workflow("current_state", ()).unwrap();
    assert_eq!(state, "done");

    let unknown = env.query_workflow::<_, String>("no_such_query", ()).unwrap_err();
    assert!(unknown.to_string().contains("unknown query type"), "{unknown}");
}

// Reserved query types are rejected at registration.
#[tokio::test]
async fn reserved_query_types_are_rejected() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("ReservedQuery", |ctx: WorkflowContext, (): ()| async move {
        let err = ctx
            .set_query_handler("__internal", |(): ()| Ok::<_, WorkflowError>(0))
            .unwrap_err();
        Ok::<_, WorkflowError>(err.to_string())
    });

    let result = env.execute_workflow("ReservedQuery", ()).await.unwrap();
    assert!(result.get::<String>().unwrap().contains("reserved"));
}

// Activities can be executed directly, without a workflow around them.
#[tokio::test]
async fn activity_executes_directly() {
    let env = TestWorkflowEnvironment::new();
    env.register_activity("Upper", |(s,): (String,)| async move {
        Ok::<_, WorkflowError>(s.to_uppercase())
    });

    let result = env.execute_activity("Upper", ("quiet",)).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "QUIET");
}

// A workflow completing with signals still buffered completes
// normally (a warning is logged for the unread names).
#[tokio::test]
async fn completion_with_unread_signals_succeeds() {
    let env = TestWorkflowEnvironment::new();
    env.signal_workflow("ignored", "data");
    env.register_workflow("IgnoresSignals", |ctx: WorkflowContext, (): ()| async move {
        // create the channel so the signal is buffered, then never read
        let _ch = ctx.get_signal_channel("ignored");
        ctx.sleep(Duration::from_secs(1)).await?;
        Ok::<_, WorkflowError>("done".to_string())
    });

    let result = env.execute_workflow("IgnoresSignals", ()).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "done");
}

// Workflow info carries the test defaults and is visible to code.
#[tokio::test]
async fn workflow_info_defaults_are_visible() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("Introspect", |ctx: WorkflowContext, (): ()| async move {
        let info = ctx.workflow_info();
        Ok::<_, WorkflowError>((
            info.workflow_execution.workflow_id,
            info.domain,
            info.task_list_name,
            info.workflow_type.name,
        ))
    });

    let result = env.execute_workflow("Introspect", ()).await.unwrap();
    let (workflow_id, domain, task_list, workflow_type) =
        result.get::<(String, String, String, String)>().unwrap();
    assert_eq!(workflow_id, "default-test-workflow-id");
    assert_eq!(domain, "default-test-domain");
    assert_eq!(task_list, "default-test-tasklist");
    assert_eq!(workflow_type, "Introspect");
}

// Workflow-observable time is the virtual clock, advanced by timers.
#[tokio::test]
async fn workflow_now_follows_virtual_clock() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("ClockWatcher", |ctx: WorkflowContext, (): ()| async move {
        let before = ctx.now();
        ctx.sleep(Duration::from_secs(42)).await?;
        let elapsed = ctx
            .now()
            .duration_since(before)
            .expect("clock moves forward");
        Ok::<_, WorkflowError>(elapsed.as_secs())
    });

    let result = env.execute_workflow("ClockWatcher", ()).await.unwrap();
    assert_eq!(result.get::<u64>().unwrap(), 42);
}
