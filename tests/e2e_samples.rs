use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use syncflow::{
    ActivityOptions, TestWorkflowEnvironment, WorkflowContext, WorkflowError,
};

fn test_activity_options() -> ActivityOptions {
    ActivityOptions {
        schedule_to_start_timeout: Duration::from_secs(10),
        start_to_close_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

// 1) Timer then complete: ten seconds of workflow time pass without
// wall-clock waiting.
#[tokio::test]
async fn timer_then_complete_over_virtual_time() {
    let env = TestWorkflowEnvironment::new();
    let scheduled = Arc::new(AtomicUsize::new(0));
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let scheduled = scheduled.clone();
        env.set_on_timer_scheduled_listener(move |_, _| {
            scheduled.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let fired = fired.clone();
        env.set_on_timer_fired_listener(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    env.register_workflow("TimerWorkflow", |ctx: WorkflowContext, (): ()| async move {
        ctx.sleep(Duration::from_secs(10)).await?;
        Ok::<_, WorkflowError>("done".to_string())
    });

    let started = std::time::Instant::now();
    let result = env.execute_workflow("TimerWorkflow", ()).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "done");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "ten virtual seconds must not cost ten wall seconds"
    );
    assert_eq!(scheduled.load(Ordering::SeqCst), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// 2) Activity success: result decoded into the caller's type.
#[tokio::test]
async fn activity_result_resolves_typed() {
    let env = TestWorkflowEnvironment::new();
    env.register_activity("Add", |(a, b): (i32, i32)| async move {
        Ok::<_, WorkflowError>(a + b)
    });
    env.register_workflow("AddWorkflow", |ctx: WorkflowContext, (): ()| async move {
        let ctx = ctx.with_activity_options(test_activity_options());
        let sum: i32 = ctx.execute_activity("Add", (2, 3)).get(&ctx).await?;
        Ok::<_, WorkflowError>(sum)
    });

    let result = env.execute_workflow("AddWorkflow", ()).await.unwrap();
    assert_eq!(result.get::<i32>().unwrap(), 5);
}

// 3) Activity cancel: the future resolves with the canceled error and
// exactly one cancel request is issued for the matching activity.
#[tokio::test]
async fn canceling_context_cancels_pending_activity() {
    let env = TestWorkflowEnvironment::new();
    let canceled_ids = Arc::new(Mutex::new(Vec::new()));
    {
        let canceled_ids = canceled_ids.clone();
        env.set_on_activity_canceled_listener(move |info| {
            canceled_ids.lock().unwrap().push(info.activity_id.0.clone());
        });
    }
    env.register_activity("LongOp", |(): ()| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, WorkflowError>("late".to_string())
    });
    env.register_workflow("CancelActivity", |ctx: WorkflowContext, (): ()| async move {
        let ctx = ctx.with_activity_options(test_activity_options());
        let (cancel_ctx, cancel) = ctx.with_cancel();
        let pending = cancel_ctx.execute_activity("LongOp", ());
        cancel.cancel();
        let err = pending.get::<String>(&ctx).await.unwrap_err();
        assert!(err.is_canceled(), "expected canceled, got {err}");
        Ok::<_, WorkflowError>("canceled".to_string())
    });

    let result = env.execute_workflow("CancelActivity", ()).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "canceled");
    assert_eq!(canceled_ids.lock().unwrap().len(), 1);
}

// 4) Selector with default: nothing ready, so the default branch runs
// exactly once and the receive branch never does.
#[tokio::test]
async fn selector_default_fires_when_channel_empty() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("SelectorDefault", |ctx: WorkflowContext, (): ()| async move {
        let ch = ctx.new_channel::<i32>();
        let received = Arc::new(AtomicUsize::new(0));
        let defaulted = Arc::new(AtomicUsize::new(0));
        let on_receive = received.clone();
        let on_default = defaulted.clone();
        let mut selector = ctx
            .new_selector()
            .add_receive(&ch, move |_, _| {
                on_receive.fetch_add(1, Ordering::SeqCst);
            })
            .add_default(move || {
                on_default.fetch_add(1, Ordering::SeqCst);
            });
        selector.select(&ctx).await;
        Ok::<_, WorkflowError>((
            received.load(Ordering::SeqCst),
            defaulted.load(Ordering::SeqCst),
        ))
    });

    let result = env.execute_workflow("SelectorDefault", ()).await.unwrap();
    assert_eq!(result.get::<(usize, usize)>().unwrap(), (0, 1));
}

// 5) Signal delivered before any workflow code runs is waiting on the
// signal channel when the code asks for it; no timer is involved.
#[tokio::test]
async fn signal_delivered_before_code_is_buffered() {
    let env = TestWorkflowEnvironment::new();
    let timers_scheduled = Arc::new(AtomicUsize::new(0));
    {
        let timers_scheduled = timers_scheduled.clone();
        env.set_on_timer_scheduled_listener(move |_, _| {
            timers_scheduled.fetch_add(1, Ordering::SeqCst);
        });
    }
    env.signal_workflow("go", "hello");
    env.register_workflow("SignalFirst", |ctx: WorkflowContext, (): ()| async move {
        let ch = ctx.get_signal_channel("go");
        let payload = ch.receive(&ctx).await.expect("signal payload");
        Ok::<_, WorkflowError>(payload.get::<String>()?)
    });

    let result = env.execute_workflow("SignalFirst", ()).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "hello");
    assert_eq!(timers_scheduled.load(Ordering::SeqCst), 0);
}

// Child workflow success, with the execution future resolving first.
#[tokio::test]
async fn child_workflow_returns_result_and_execution() {
    let env = TestWorkflowEnvironment::new();
    let child_started = Arc::new(AtomicUsize::new(0));
    let child_completed = Arc::new(AtomicUsize::new(0));
    {
        let child_started = child_started.clone();
        env.set_on_child_workflow_started_listener(move |_, _| {
            child_started.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let child_completed = child_completed.clone();
        env.set_on_child_workflow_completed_listener(move |_, _| {
            child_completed.fetch_add(1, Ordering::SeqCst);
        });
    }
    env.register_workflow("Double", |_ctx: WorkflowContext, (n,): (i32,)| async move {
        Ok::<_, WorkflowError>(n * 2)
    });
    env.register_workflow("Parent", |ctx: WorkflowContext, (): ()| async move {
        let child = ctx.execute_child_workflow("Double", (21,));
        let execution = child.get_child_workflow_execution().get(&ctx).await?;
        assert!(execution.run_id.ends_with("_RunID"));
        let doubled: i32 = child.get(&ctx).await?;
        Ok::<_, WorkflowError>(doubled)
    });

    let result = env.execute_workflow("Parent", ()).await.unwrap();
    assert_eq!(result.get::<i32>().unwrap(), 42);
    assert_eq!(child_started.load(Ordering::SeqCst), 1);
    assert_eq!(child_completed.load(Ordering::SeqCst), 1);
}

// Canceling the parent scope cancels the child workflow; its result
// future resolves with the canceled error.
#[tokio::test]
async fn canceling_context_cancels_child_workflow() {
    let env = TestWorkflowEnvironment::new();
    let child_canceled = Arc::new(AtomicUsize::new(0));
    {
        let child_canceled = child_canceled.clone();
        env.set_on_child_workflow_canceled_listener(move |_| {
            child_canceled.fetch_add(1, Ordering::SeqCst);
        });
    }
    env.register_workflow("SlowChild", |ctx: WorkflowContext, (): ()| async move {
        ctx.sleep(Duration::from_secs(3600)).await?;
        Ok::<_, WorkflowError>("never".to_string())
    });
    env.register_workflow("CancelChild", |ctx: WorkflowContext, (): ()| async move {
        let (cancel_ctx, cancel) = ctx.with_cancel();
        let child = cancel_ctx.execute_child_workflow("SlowChild", ());
        let _execution = child.get_child_workflow_execution().get(&ctx).await?;
        cancel.cancel();
        let err = child.get::<String>(&ctx).await.unwrap_err();
        Ok::<_, WorkflowError>(err.is_canceled())
    });

    let result = env.execute_workflow("CancelChild", ()).await.unwrap();
    assert!(result.get::<bool>().unwrap());
    assert_eq!(child_canceled.load(Ordering::SeqCst), 1);
}

// Mocked activity results are matched by name and arguments; the real
// implementation never runs (it is not even registered).
#[tokio::test]
async fn mocked_activity_results_matched_by_args() {
    let env = TestWorkflowEnvironment::new();
    env.mock_activity_result("Lookup", Some(("alice",)), Ok::<_, WorkflowError>(1001u64));
    env.mock_activity_result("Lookup", None::<()>, Ok::<_, WorkflowError>(0u64));
    env.register_workflow("Lookups", |ctx: WorkflowContext, (): ()| async move {
        let ctx = ctx.with_activity_options(test_activity_options());
        let known: u64 = ctx.execute_activity("Lookup", ("alice",)).get(&ctx).await?;
        let unknown: u64 = ctx.execute_activity("Lookup", ("bob",)).get(&ctx).await?;
        Ok::<_, WorkflowError>((known, unknown))
    });

    let result = env.execute_workflow("Lookups", ()).await.unwrap();
    assert_eq!(result.get::<(u64, u64)>().unwrap(), (1001, 0));
}

// A mocked workflow result short-circuits a child workflow; nothing
// needs to be registered under the child's name.
#[tokio::test]
async fn mocked_child_workflow_result() {
    let env = TestWorkflowEnvironment::new();
    env.mock_workflow_result("Billing", None::<()>, Ok::<_, WorkflowError>("mocked-invoice"));
    env.register_workflow("Checkout", |ctx: WorkflowContext, (): ()| async move {
        let invoice: String = ctx.execute_child_workflow("Billing", ()).get(&ctx).await?;
        Ok::<_, WorkflowError>(invoice)
    });

    let result = env.execute_workflow("Checkout", ()).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "mocked-invoice");
}

// An overridden child workflow runs the fake implementation in a real
// child environment.
#[tokio::test]
async fn overridden_child_workflow_runs_fake() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("Scorer", |_ctx: WorkflowContext, (n,): (i32,)| async move {
        Ok::<_, WorkflowError>(n * 100)
    });
    env.override_workflow("Scorer", |_ctx: WorkflowContext, (n,): (i32,)| async move {
        Ok::<_, WorkflowError>(n)
    });
    env.register_workflow("Scoring", |ctx: WorkflowContext, (): ()| async move {
        let score: i32 = ctx.execute_child_workflow("Scorer", (7,)).get(&ctx).await?;
        Ok::<_, WorkflowError>(score)
    });

    let result = env.execute_workflow("Scoring", ()).await.unwrap();
    assert_eq!(result.get::<i32>().unwrap(), 7);
}

// An override substitutes the whole function while the real one stays
// registered.
#[tokio::test]
async fn overridden_activity_replaces_registered_one() {
    let env = TestWorkflowEnvironment::new();
    env.register_activity("Greet", |(name,): (String,)| async move {
        Ok::<_, WorkflowError>(format!("hello {name}"))
    });
    env.override_activity("Greet", |(name,): (String,)| async move {
        Ok::<_, WorkflowError>(format!("fake {name}"))
    });
    env.register_workflow("Greeter", |ctx: WorkflowContext, (): ()| async move {
        let ctx = ctx.with_activity_options(test_activity_options());
        let greeting: String = ctx.execute_activity("Greet", ("ada",)).get(&ctx).await?;
        Ok::<_, WorkflowError>(greeting)
    });

    let result = env.execute_workflow("Greeter", ()).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "fake ada");
}

// An activity that signals asynchronous completion is finished later
// through complete_activity.
#[tokio::test]
async fn activity_completes_asynchronously() {
    let env = TestWorkflowEnvironment::new();
    env.register_activity("AsyncOp", |(): ()| async move {
        Err::<String, _>(WorkflowError::ResultPending)
    });
    {
        let completer = env.clone();
        env.set_on_activity_completed_listener(move |info, result| {
            if matches!(result, Err(WorkflowError::ResultPending)) {
                completer.complete_activity(
                    &info.activity_id.0,
                    Ok::<_, WorkflowError>("async-done".to_string()),
                );
            }
        });
    }
    env.register_workflow("WaitsForAsyncOp", |ctx: WorkflowContext, (): ()| async move {
        let ctx = ctx.with_activity_options(test_activity_options());
        let out: String = ctx.execute_activity("AsyncOp", ()).get(&ctx).await?;
        Ok::<_, WorkflowError>(out)
    });

    let result = env.execute_workflow("WaitsForAsyncOp", ()).await.unwrap();
    assert_eq!(result.get::<String>().unwrap(), "async-done");
}

// Heartbeats recorded from activity code reach the heartbeat listener.
#[tokio::test]
async fn activity_heartbeats_reach_listener() {
    let env = TestWorkflowEnvironment::new();
    let heartbeats = Arc::new(AtomicUsize::new(0));
    {
        let heartbeats = heartbeats.clone();
        env.set_on_activity_heartbeat_listener(move |_, _| {
            heartbeats.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let recorder = env.clone();
        env.set_on_activity_started_listener(move |info, _| {
            recorder.record_activity_heartbeat(&info.activity_id.0, "progress");
        });
    }
    env.register_activity("Work", |(): ()| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, WorkflowError>(())
    });
    env.register_workflow("HeartbeatWorkflow", |ctx: WorkflowContext, (): ()| async move {
        let ctx = ctx.with_activity_options(test_activity_options());
        ctx.execute_activity("Work", ()).get::<()>(&ctx).await?;
        Ok::<_, WorkflowError>(())
    });

    env.execute_workflow("HeartbeatWorkflow", ()).await.unwrap();
    assert_eq!(heartbeats.load(Ordering::SeqCst), 1);
}

// Canceling the whole workflow cancels its pending timer and the
// workflow reports the canceled error.
#[tokio::test]
async fn cancel_workflow_cancels_pending_timer() {
    let env = TestWorkflowEnvironment::new();
    let timers_canceled = Arc::new(AtomicUsize::new(0));
    {
        let timers_canceled = timers_canceled.clone();
        env.set_on_timer_canceled_listener(move |_| {
            timers_canceled.fetch_add(1, Ordering::SeqCst);
        });
    }
    env.register_workflow("Cancelable", |ctx: WorkflowContext, (): ()| async move {
        ctx.sleep(Duration::from_secs(3600)).await?;
        Ok::<_, WorkflowError>("finished".to_string())
    });
    {
        let canceler = env.clone();
        env.register_delayed_callback(Duration::from_secs(10), move || canceler.cancel_workflow());
    }

    let err = env.execute_workflow("Cancelable", ()).await.unwrap_err();
    assert!(err.is_canceled(), "expected canceled, got {err}");
    assert_eq!(timers_canceled.load(Ordering::SeqCst), 1);
}
