//! End-to-end tests driving the runtime through the interpreter, queue
//! manager, and cancellation machinery.

use crate::context::RunContext;
use crate::core::{steps, Outcome, StepOutcome, Value};
use crate::errors::{PipelineError, RuntimeError};
use crate::interpreter::Resumable;
use crate::pipeline::Pipeline;
use crate::registry::InstanceId;
use crate::runtime::{in_pipeline, Invoked, Runtime, RuntimeOptions};
use crate::testing::{
    append_step, append_value_step, delay_step, failing_step, CountingReporter,
    RecordingCancelObserver,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn context() -> Arc<RunContext> {
    Arc::new(RunContext::new())
}

fn log_of(context: &RunContext) -> Vec<Value> {
    context
        .state_ref("log")
        .get()
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn start(ctx: &Arc<RunContext>, pipelines: Vec<(&str, Pipeline)>) -> Runtime {
    Runtime::start(ctx.clone(), pipelines, RuntimeOptions::default())
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Body used by the timing scenarios: wait 250 ms, then append the arg.
fn slow_append() -> Pipeline {
    Pipeline::builder()
        .step(delay_step(250))
        .step(append_step("log"))
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_restartable_keeps_only_the_last_invocation() {
    let ctx = context();
    let runtime = start(&ctx, vec![("search", slow_append().restartable(1))]);

    let mut handles = Vec::new();
    for (pause, arg) in [
        (0, "S"),
        (20, "SE"),
        (20, "SEA"),
        (20, "SEAR"),
        (0, "SEARC"),
        (20, "SEARCH"),
    ] {
        sleep_ms(pause).await;
        handles.push(runtime.invoke("search", serde_json::json!(arg)).unwrap());
    }

    let outcomes: Vec<Outcome> =
        futures::future::join_all(handles.into_iter().map(Invoked::settled)).await;
    assert_eq!(log_of(&ctx), vec![serde_json::json!("SEARCH")]);
    assert_eq!(
        outcomes.last(),
        Some(&Outcome::Value(serde_json::json!("SEARCH")))
    );
    assert!(outcomes[..5].iter().all(Outcome::is_cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_admits_only_the_first() {
    let ctx = context();
    let runtime = start(&ctx, vec![("task", slow_append().dropping(1))]);

    let first = runtime.invoke("task", serde_json::json!(1)).unwrap();
    let mut dropped = Vec::new();
    for arg in 2..=6 {
        sleep_ms(20).await;
        dropped.push(runtime.invoke("task", serde_json::json!(arg)).unwrap());
    }

    // Refused invocations settle to the sentinel synchronously.
    for invoked in dropped {
        assert!(matches!(invoked, Invoked::Completed(Outcome::Cancelled)));
    }

    assert_eq!(first.settled().await, Outcome::Value(serde_json::json!(1)));
    assert_eq!(log_of(&ctx), vec![serde_json::json!(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_enqueued_runs_in_fifo_order() {
    let ctx = context();
    let body = Pipeline::builder()
        .step(append_step("log"))
        .step(delay_step(50))
        .step(steps::call(|input| {
            let state = input.context.state_ref("log");
            let done = serde_json::json!(format!(
                "DONE-{}",
                input.value.as_str().unwrap_or_default()
            ));
            crate::context::update_ref(&state, move |list| {
                let mut list = list.as_array().cloned().unwrap_or_default();
                list.push(done.clone());
                Value::Array(list)
            })
        }))
        .build();
    let runtime = start(&ctx, vec![("work", body.enqueued(1))]);

    let order = ["FIRST", "SECOND", "THIRD", "FOURTH", "FIFTH", "SIXTH"];
    let handles: Vec<Invoked> = order
        .iter()
        .map(|arg| runtime.invoke("work", serde_json::json!(arg)).unwrap())
        .collect();
    for handle in handles {
        handle.settled().await;
    }

    let expected: Vec<Value> = order
        .iter()
        .flat_map(|arg| {
            [
                serde_json::json!(arg),
                serde_json::json!(format!("DONE-{arg}")),
            ]
        })
        .collect();
    assert_eq!(log_of(&ctx), expected);
}

#[tokio::test(start_paused = true)]
async fn test_keep_latest_retains_one_pending() {
    let ctx = context();
    let runtime = start(&ctx, vec![("task", slow_append().keep_latest(1))]);

    let mut handles = Vec::new();
    for arg in 1..=6 {
        handles.push(runtime.invoke("task", serde_json::json!(arg)).unwrap());
        sleep_ms(20).await;
    }

    let outcomes: Vec<Outcome> =
        futures::future::join_all(handles.into_iter().map(Invoked::settled)).await;
    assert_eq!(
        log_of(&ctx),
        vec![serde_json::json!(1), serde_json::json!(6)]
    );
    assert_eq!(outcomes[0], Outcome::Value(serde_json::json!(1)));
    assert!(outcomes[1..5].iter().all(Outcome::is_cancelled));
    assert_eq!(outcomes[5], Outcome::Value(serde_json::json!(6)));
}

#[test]
fn test_rescue_and_finally_run_in_order() {
    let ctx = context();
    let reporter = Arc::new(CountingReporter::new());
    let pipeline = Pipeline::builder()
        .step(append_value_step("log", serde_json::json!(":begin")))
        .step(failing_step("boom"))
        .rescue(append_value_step("log", serde_json::json!(":rescue")))
        .finally(append_value_step("log", serde_json::json!(":finally")))
        .build();
    let runtime = Runtime::start(
        ctx.clone(),
        vec![("guarded", pipeline)],
        RuntimeOptions::default().with_error_reporter(reporter.clone()),
    );

    let invoked = runtime.invoke("guarded", Value::Null).unwrap();
    assert!(matches!(invoked, Invoked::Completed(Outcome::Value(_))));
    assert_eq!(
        log_of(&ctx),
        vec![
            serde_json::json!(":begin"),
            serde_json::json!(":rescue"),
            serde_json::json!(":finally"),
        ]
    );
    assert_eq!(reporter.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_spares_exempt_pipelines() {
    let ctx = context();
    let victim = Pipeline::builder()
        .step(delay_step(100))
        .step(append_value_step("log", serde_json::json!("done-victim")))
        .build();
    let survivor = Pipeline::builder()
        .step(delay_step(100))
        .step(append_value_step("log", serde_json::json!("done-survivor")))
        .build()
        .cancel_on_shutdown(false);
    let runtime = start(&ctx, vec![("victim", victim), ("survivor", survivor)]);

    let victim_run = runtime.invoke("victim", Value::Null).unwrap();
    let survivor_run = runtime.invoke("survivor", Value::Null).unwrap();
    sleep_ms(10).await;
    runtime.stop();

    assert!(victim_run.settled().await.is_cancelled());
    assert!(matches!(survivor_run.settled().await, Outcome::Value(_)));
    assert_eq!(log_of(&ctx), vec![serde_json::json!("done-survivor")]);

    // stop is idempotent, and a stopped runtime refuses invocations
    runtime.stop();
    assert!(matches!(
        runtime.invoke("victim", Value::Null),
        Err(RuntimeError::Stopped)
    ));
}

#[test]
fn test_sync_pipeline_completes_unwrapped_and_is_idempotent() {
    let ctx = context();
    let pipeline = Pipeline::builder()
        .step(steps::compute(|input| {
            serde_json::json!(input.value.as_i64().unwrap_or(0) + 1)
        }))
        .step(steps::compute(|input| {
            serde_json::json!(input.value.as_i64().unwrap_or(0) * 10)
        }))
        .build();
    let runtime = start(&ctx, vec![("math", pipeline)]);

    for _ in 0..2 {
        match runtime.invoke("math", serde_json::json!(3)).unwrap() {
            Invoked::Completed(Outcome::Value(v)) => assert_eq!(v, serde_json::json!(40)),
            other => panic!("expected sync completion, got {other:?}"),
        }
    }
}

#[test]
fn test_null_step_return_preserves_value() {
    let ctx = context();
    let pipeline = Pipeline::builder()
        .step(steps::value(serde_json::json!("kept")))
        .step(steps::compute(|_input| Value::Null))
        .step(steps::effect(|_input| {}))
        .build();
    let runtime = start(&ctx, vec![("keep", pipeline)]);

    match runtime.invoke("keep", Value::Null).unwrap() {
        Invoked::Completed(Outcome::Value(v)) => assert_eq!(v, serde_json::json!("kept")),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_use_existing_shares_the_result_cell() {
    let ctx = context();
    let pipeline = Pipeline::builder()
        .step(delay_step(50))
        .step(steps::compute(|input| {
            serde_json::json!(format!("fetched-{}", input.value.as_str().unwrap_or("")))
        }))
        .build()
        .use_existing();
    let runtime = start(&ctx, vec![("fetch", pipeline)]);

    let first = runtime
        .invoke("fetch", serde_json::json!("a"))
        .unwrap()
        .pending()
        .unwrap();
    let second = runtime
        .invoke("fetch", serde_json::json!("a"))
        .unwrap()
        .pending()
        .unwrap();
    let other = runtime
        .invoke("fetch", serde_json::json!("b"))
        .unwrap()
        .pending()
        .unwrap();

    assert!(first.same_cell(&second));
    assert!(!first.same_cell(&other));
    assert_eq!(
        second.wait().await,
        Outcome::Value(serde_json::json!("fetched-a"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_error_reporter_called_once_for_uncaught_async_error() {
    let ctx = context();
    let reporter = Arc::new(CountingReporter::new());
    let failing = Pipeline::builder()
        .step(delay_step(10))
        .step(steps::future(|_input| async {
            StepOutcome::Fail(PipelineError::step("async boom"))
        }))
        .build();
    let rescued = Pipeline::builder()
        .step(delay_step(10))
        .step(steps::future(|_input| async {
            StepOutcome::Fail(PipelineError::step("caught boom"))
        }))
        .rescue(steps::value(serde_json::json!("recovered")))
        .build();
    let runtime = Runtime::start(
        ctx.clone(),
        vec![("failing", failing), ("rescued", rescued)],
        RuntimeOptions::default().with_error_reporter(reporter.clone()),
    );

    let outcome = runtime
        .invoke("failing", Value::Null)
        .unwrap()
        .settled()
        .await;
    assert_eq!(outcome, Outcome::Failed(PipelineError::step("async boom")));
    assert_eq!(reporter.count(), 1);

    let outcome = runtime
        .invoke("rescued", Value::Null)
        .unwrap()
        .settled()
        .await;
    assert_eq!(outcome, Outcome::Value(serde_json::json!("recovered")));
    assert_eq!(reporter.count(), 1);
}

#[test]
fn test_nested_pipeline_feeds_its_value_to_the_parent() {
    let ctx = context();
    let inner = Pipeline::builder()
        .step(steps::compute(|input| {
            serde_json::json!(input.value.as_i64().unwrap_or(0) * 2)
        }))
        .build();
    let outer = Pipeline::builder()
        .step(steps::pipeline(inner))
        .step(steps::compute(|input| {
            serde_json::json!(input.value.as_i64().unwrap_or(0) + 1)
        }))
        .build();
    let runtime = start(&ctx, vec![("outer", outer)]);

    match runtime.invoke("outer", serde_json::json!(5)).unwrap() {
        Invoked::Completed(Outcome::Value(v)) => assert_eq!(v, serde_json::json!(11)),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_a_child_cancels_the_whole_tree() {
    let ctx = context();
    let observer = Arc::new(RecordingCancelObserver::new());
    let child_ident: Arc<Mutex<Option<InstanceId>>> = Arc::new(Mutex::new(None));
    let capture = child_ident.clone();

    let child = Pipeline::builder()
        .step(steps::with_scope(move |scope| {
            *capture.lock() = Some(scope.ident);
            StepOutcome::Unchanged
        }))
        .step(delay_step(200))
        .build();
    let parent = Pipeline::builder()
        .step(steps::pipeline(child))
        .step(append_value_step("log", serde_json::json!("parent-done")))
        .build();
    let runtime = Runtime::start(
        ctx.clone(),
        vec![("parent", parent)],
        RuntimeOptions::default().with_cancel_observer(observer.clone()),
    );

    let parent_run = runtime.invoke("parent", Value::Null).unwrap();
    sleep_ms(10).await;

    let child_id = child_ident.lock().expect("child ran");
    runtime.cancel(child_id);

    assert!(parent_run.settled().await.is_cancelled());
    sleep_ms(10).await;
    assert!(observer.abandoned().contains(&child_id));
    assert!(log_of(&ctx).is_empty());
    assert!(runtime.get_active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_detached_child_survives_its_parent() {
    let ctx = context();
    let background = Pipeline::builder()
        .step(delay_step(50))
        .step(append_value_step("log", serde_json::json!("detached-done")))
        .build()
        .detached(true);
    let parent = Pipeline::builder()
        .step(steps::with_scope(move |scope| {
            match scope.invoke(&background, Value::Null) {
                Ok(Invoked::Detached) => StepOutcome::Unchanged,
                other => panic!("expected detached invocation, got {other:?}"),
            }
        }))
        .step(steps::value(serde_json::json!("parent-value")))
        .build();
    let runtime = start(&ctx, vec![("parent", parent)]);

    // The parent completes synchronously: the detached child is not linked.
    match runtime.invoke("parent", Value::Null).unwrap() {
        Invoked::Completed(Outcome::Value(v)) => assert_eq!(v, serde_json::json!("parent-value")),
        other => panic!("unexpected: {other:?}"),
    }

    sleep_ms(100).await;
    assert_eq!(log_of(&ctx), vec![serde_json::json!("detached-done")]);
}

#[test]
fn test_queue_config_mismatch_is_fatal_at_invoke() {
    let ctx = context();
    let a = Pipeline::builder().build().with_queue("shared").enqueued(1);
    let b = Pipeline::builder()
        .step(steps::effect(|_input| {}))
        .build()
        .with_queue("shared")
        .restartable(1);
    let runtime = start(&ctx, vec![("a", a), ("b", b)]);

    runtime.invoke("a", Value::Null).unwrap();
    assert!(matches!(
        runtime.invoke("b", Value::Null),
        Err(RuntimeError::QueueConfigMismatch { queue }) if queue == "shared"
    ));
}

#[test]
fn test_unknown_pipeline() {
    let runtime = start(&context(), Vec::new());
    assert!(matches!(
        runtime.invoke("missing", Value::Null),
        Err(RuntimeError::UnknownPipeline { name }) if name == "missing"
    ));
    assert!(!runtime.has_pipeline("missing"));
}

#[tokio::test(start_paused = true)]
async fn test_get_active_reports_live_instances() {
    let ctx = context();
    let pipeline = Pipeline::builder().step(delay_step(100)).build();
    let runtime = start(&ctx, vec![("busy", pipeline)]);

    let run = runtime.invoke("busy", serde_json::json!("payload")).unwrap();
    let active = runtime.get_active();
    let members = active.get("busy").expect("queue listed");
    assert_eq!(members.len(), 1);
    let snapshot = members.values().next().unwrap();
    assert_eq!(snapshot.args, serde_json::json!("payload"));

    run.settled().await;
    assert!(runtime.get_active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_last_result_and_last_error_per_queue() {
    let ctx = context();
    let ok = Pipeline::builder()
        .step(delay_step(5))
        .step(steps::value(serde_json::json!("fine")))
        .build()
        .with_queue("mixed");
    let bad = Pipeline::builder()
        .step(delay_step(5))
        .step(failing_step("broken"))
        .build()
        .with_queue("mixed");
    let runtime = Runtime::start(
        ctx.clone(),
        vec![("ok", ok), ("bad", bad)],
        RuntimeOptions::default().with_error_reporter(Arc::new(crate::runtime::NoOpErrorReporter)),
    );

    runtime.invoke("ok", Value::Null).unwrap().settled().await;
    runtime.invoke("bad", Value::Null).unwrap().settled().await;

    assert_eq!(runtime.last_result("mixed"), Some(serde_json::json!("fine")));
    assert_eq!(
        runtime.last_error("mixed"),
        Some(PipelineError::step("broken"))
    );
}

#[test]
fn test_muted_restores_the_outer_value() {
    let ctx = context();
    let noisy = Pipeline::builder()
        .step(append_value_step("log", serde_json::json!("ran")))
        .step(steps::value(serde_json::json!("inner-value")))
        .build();
    let outer = Pipeline::builder()
        .step(steps::value(serde_json::json!("outer-value")))
        .step(steps::pipeline(noisy.muted()))
        .step(append_step("log"))
        .build();
    let runtime = start(&ctx, vec![("outer", outer)]);

    match runtime.invoke("outer", Value::Null).unwrap() {
        Invoked::Completed(Outcome::Value(v)) => assert_eq!(v, serde_json::json!("outer-value")),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(
        log_of(&ctx),
        vec![serde_json::json!("ran"), serde_json::json!("outer-value")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_future_resolving_to_a_pipeline_is_invoked() {
    let ctx = context();
    let follow_up = Pipeline::builder()
        .step(steps::compute(|input| {
            serde_json::json!(format!("followed-{}", input.value.as_str().unwrap_or("")))
        }))
        .build();
    let pipeline = Pipeline::builder()
        .step(steps::future(move |_input| {
            let follow_up = follow_up.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                StepOutcome::Pipeline(follow_up)
            }
        }))
        .build();
    let runtime = start(&ctx, vec![("chained", pipeline)]);

    let outcome = runtime
        .invoke("chained", serde_json::json!("x"))
        .unwrap()
        .settled()
        .await;
    assert_eq!(outcome, Outcome::Value(serde_json::json!("followed-x")));
}

#[test]
fn test_step_can_replace_the_remaining_stack() {
    let ctx = context();
    let pipeline = Pipeline::builder()
        .step(steps::with_scope(|scope| {
            let mut frame = scope.stack.innermost().expect("own frame").resumable.clone();
            frame.remaining.clear();
            frame
                .remaining
                .push_back(append_value_step("log", serde_json::json!("rewritten")));
            StepOutcome::Resumable(Box::new(frame))
        }))
        .step(append_value_step("log", serde_json::json!("skipped")))
        .build();
    let runtime = start(&ctx, vec![("rewrite", pipeline)]);

    runtime.invoke("rewrite", Value::Null).unwrap();
    assert_eq!(log_of(&ctx), vec![serde_json::json!("rewritten")]);
}

#[test]
fn test_tail_runs_first_and_feeds_the_resumed_value() {
    let ctx = context();
    let tail_pipeline = Pipeline::builder()
        .step(steps::value(serde_json::json!("from-tail")))
        .build();
    let pipeline = Pipeline::builder()
        .step(steps::with_scope(move |scope| {
            let mut frame = scope.stack.innermost().expect("own frame").resumable.clone();
            frame.tail = Some(Box::new(Resumable::new(tail_pipeline.clone(), Value::Null)));
            StepOutcome::Resumable(Box::new(frame))
        }))
        .step(append_step("log"))
        .build();
    let runtime = start(&ctx, vec![("tailed", pipeline)]);

    runtime.invoke("tailed", Value::Null).unwrap();
    assert_eq!(log_of(&ctx), vec![serde_json::json!("from-tail")]);
}

#[test]
fn test_rewriting_an_ancestor_injects_steps_without_rerunning() {
    let ctx = context();
    let inner = Pipeline::builder()
        .step(steps::with_scope(|scope| {
            let ancestor = scope.stack.frames.get(1).expect("parent frame").clone();
            let mut rewritten = ancestor.resumable;
            rewritten
                .remaining
                .push_front(append_value_step("log", serde_json::json!("injected")));
            assert!(scope.rewrite_ancestor(ancestor.ident, rewritten));
            StepOutcome::Value(serde_json::json!("inner-result"))
        }))
        .build();
    let outer = Pipeline::builder()
        .step(steps::pipeline(inner))
        .step(append_step("log"))
        .build();
    let runtime = start(&ctx, vec![("outer", outer)]);

    runtime.invoke("outer", Value::Null).unwrap();
    assert_eq!(
        log_of(&ctx),
        vec![
            serde_json::json!("injected"),
            serde_json::json!("inner-result"),
        ]
    );
}

#[test]
fn test_in_pipeline_is_scoped_to_interpreter_chunks() {
    let ctx = context();
    let observed = Arc::new(Mutex::new(false));
    let capture = observed.clone();
    let pipeline = Pipeline::builder()
        .step(steps::effect(move |_input| {
            *capture.lock() = in_pipeline();
        }))
        .build();
    let runtime = start(&ctx, vec![("probe", pipeline)]);

    assert!(!in_pipeline());
    runtime.invoke("probe", Value::Null).unwrap();
    assert!(*observed.lock());
    assert!(!in_pipeline());
}

#[tokio::test(start_paused = true)]
async fn test_queue_function_shards_by_args() {
    let ctx = context();
    let pipeline = Pipeline::builder()
        .step(delay_step(50))
        .step(append_step("log"))
        .build()
        .enqueued(1)
        .with_queue_fn(|args| format!("shard-{}", args.as_str().unwrap_or("?")));
    let runtime = start(&ctx, vec![("sharded", pipeline)]);

    let a1 = runtime.invoke("sharded", serde_json::json!("a")).unwrap();
    let a2 = runtime.invoke("sharded", serde_json::json!("a")).unwrap();
    let b = runtime.invoke("sharded", serde_json::json!("b")).unwrap();

    let active = runtime.get_active();
    assert!(active.contains_key("shard-a"));
    assert!(active.contains_key("shard-b"));
    assert_eq!(active["shard-a"].len(), 2);

    for run in [a1, a2, b] {
        run.settled().await;
    }
    assert_eq!(log_of(&ctx).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate_shape() {
    let ctx = context();
    ctx.state_ref("cache").reset(serde_json::json!("cached"));

    let refresh = Pipeline::builder()
        .step(delay_step(100))
        .step(steps::call(|input| {
            let state = input.context.state_ref("cache");
            state.reset(serde_json::json!("fresh"));
            StepOutcome::Unchanged
        }))
        .build()
        .detached(true);

    let lookup = Pipeline::builder()
        .step(steps::with_scope(move |scope| {
            let cached = scope.context.state_ref("cache").get();
            if cached.is_null() {
                return StepOutcome::Unchanged;
            }
            // Serve the cached value now; refresh in the background.
            scope
                .invoke(&refresh, Value::Null)
                .expect("refresh admitted");
            let mut frame = scope.stack.innermost().expect("own frame").resumable.clone();
            frame.remaining.clear();
            frame.apply_value(cached);
            StepOutcome::Resumable(Box::new(frame))
        }))
        .step(delay_step(250))
        .step(steps::value(serde_json::json!("slow-path")))
        .build();
    let runtime = start(&ctx, vec![("lookup", lookup)]);

    // Served synchronously from cache, skipping the slow path entirely.
    match runtime.invoke("lookup", Value::Null).unwrap() {
        Invoked::Completed(Outcome::Value(v)) => assert_eq!(v, serde_json::json!("cached")),
        other => panic!("unexpected: {other:?}"),
    }

    sleep_ms(150).await;
    assert_eq!(ctx.state_ref("cache").get(), serde_json::json!("fresh"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_resolves_the_handle_and_reports_abandonment() {
    let ctx = context();
    let observer = Arc::new(RecordingCancelObserver::new());
    let ident_slot: Arc<Mutex<Option<InstanceId>>> = Arc::new(Mutex::new(None));
    let capture = ident_slot.clone();
    let pipeline = Pipeline::builder()
        .step(steps::with_scope(move |scope| {
            *capture.lock() = Some(scope.ident);
            StepOutcome::Unchanged
        }))
        .step(delay_step(500))
        .build();
    let runtime = Runtime::start(
        ctx.clone(),
        vec![("slow", pipeline)],
        RuntimeOptions::default().with_cancel_observer(observer.clone()),
    );

    let run = runtime.invoke("slow", Value::Null).unwrap();
    sleep_ms(10).await;
    let ident = ident_slot.lock().expect("instance ran");
    runtime.cancel(ident);

    assert!(run.settled().await.is_cancelled());
    sleep_ms(10).await;
    assert_eq!(observer.abandoned(), vec![ident]);
}

#[tokio::test(start_paused = true)]
async fn test_watcher_installed_at_start_and_removed_at_stop() {
    use crate::context::StateRef;
    use crate::runtime::StateWatcher;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);
    impl StateWatcher for Recorder {
        fn on_change(&self, key: &str, _state: &StateRef, _old: &Value, _new: &Value) {
            self.0.lock().push(key.to_string());
        }
    }

    let ctx = context();
    let watcher = Arc::new(Recorder::default());
    let pipeline = Pipeline::builder()
        .step(append_value_step("log", serde_json::json!(1)))
        .build();
    let runtime = Runtime::start(
        ctx.clone(),
        vec![("writer", pipeline)],
        RuntimeOptions::default().with_watcher(watcher.clone()),
    );

    runtime.invoke("writer", Value::Null).unwrap();
    assert_eq!(watcher.0.lock().clone(), vec!["log".to_string()]);

    runtime.stop();
    ctx.state_ref("log").reset(Value::Null);
    assert_eq!(watcher.0.lock().len(), 1);
}
