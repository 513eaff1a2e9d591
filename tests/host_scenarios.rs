//! End-to-end control scenarios driven through a scripted engine.

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use arbor_host::engine::{ActivityCompletion, BookmarkResumption, EngineFault};
use arbor_host::{
    ControlError, InstanceController, InstanceLifecycle, InstanceOptions, UnhandledExceptionAction,
};

use support::{CountingHandler, EngineStep, ScriptedEngine};

const T: Duration = Duration::from_secs(5);

fn controller_with(
    script: Vec<EngineStep>,
    handler: Arc<CountingHandler>,
) -> (InstanceController, support::EngineProbe) {
    let (engine, probe) = ScriptedEngine::new(script);
    let controller = InstanceController::new(
        engine,
        InstanceOptions {
            handler,
            ..InstanceOptions::default()
        },
    );
    (controller, probe)
}

#[tokio::test]
async fn test_immediate_completion_raises_completed_once_without_idle() {
    let handler = CountingHandler::new();
    let (controller, _probe) = controller_with(vec![EngineStep::complete()], handler.clone());

    controller.run(T).await.unwrap();

    assert_eq!(handler.completed_count(), 1);
    assert_eq!(handler.idle_count(), 0);
    let outcome = controller.completion_outcome().expect("completion cached");
    assert_eq!(outcome.completion, ActivityCompletion::Closed);

    // A second run is a state conflict and never re-raises completion.
    let err = controller.run(T).await.unwrap_err();
    assert!(matches!(err, ControlError::TerminatedOrCompleted));
    assert_eq!(handler.completed_count(), 1);
}

#[tokio::test]
async fn test_resume_bookmark_before_any_run_auto_runs() {
    let handler = CountingHandler::new();
    let (controller, probe) = controller_with(
        vec![EngineStep::bookmark("B"), EngineStep::complete()],
        handler.clone(),
    );

    let result = controller
        .resume_bookmark("B", json!(42), T)
        .await
        .unwrap();

    assert_eq!(result, BookmarkResumption::Success);
    assert_eq!(probe.resumed(), vec![("B".to_string(), json!(42))]);
    assert_eq!(handler.completed_count(), 1);
}

#[tokio::test]
async fn test_resume_missing_bookmark_returns_not_found_once_complete() {
    let handler = CountingHandler::new();
    let (controller, _probe) = controller_with(vec![EngineStep::complete()], handler.clone());

    let result = controller
        .resume_bookmark("never-created", json!(1), T)
        .await
        .unwrap();

    assert_eq!(result, BookmarkResumption::NotFound);
}

#[tokio::test]
async fn test_resume_retries_after_engine_refusal() {
    let handler = CountingHandler::new();
    let (controller, probe) = controller_with(vec![EngineStep::bookmark("B")], handler.clone());

    controller.run(T).await.unwrap();
    probe.refuse_next_resumptions(1);

    let resumer = controller.clone();
    let task =
        tokio::spawn(async move { resumer.resume_bookmark("B", json!(7), T).await });

    // Let the first attempt observe NotReady and park its deferred retry.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Any granted operation advances the admission counter, which is what
    // makes the deferred retry admissible again.
    let names: Vec<String> = controller
        .bookmarks(T)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(names, vec!["B".to_string()]);

    let result = task.await.unwrap().unwrap();
    assert_eq!(result, BookmarkResumption::Success);
    assert_eq!(probe.resumed(), vec![("B".to_string(), json!(7))]);
}

#[tokio::test]
async fn test_resume_times_out_while_engine_keeps_refusing() {
    let handler = CountingHandler::new();
    let (controller, probe) = controller_with(vec![EngineStep::bookmark("B")], handler.clone());

    controller.run(T).await.unwrap();
    probe.refuse_next_resumptions(usize::MAX);

    let err = controller
        .resume_bookmark("B", json!(0), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Timeout));
}

#[tokio::test]
async fn test_idle_not_raised_without_execution() {
    let handler = CountingHandler::new();
    let (controller, _probe) = controller_with(vec![EngineStep::bookmark("B")], handler.clone());

    controller.run(T).await.unwrap();
    assert_eq!(handler.idle_count(), 1);

    // Observations grant the turn but execute nothing, so the engine
    // reporting Idle again must not re-raise the notification.
    controller.bookmarks(T).await.unwrap();
    controller.bookmarks(T).await.unwrap();
    assert_eq!(handler.idle_count(), 1);
}

#[tokio::test]
async fn test_concurrent_aborts_invoke_engine_abort_once() {
    let handler = CountingHandler::new();
    let (controller, probe) = controller_with(vec![EngineStep::bookmark("B")], handler.clone());
    controller.run(T).await.unwrap();

    let mut tasks = Vec::new();
    for index in 0..4 {
        let aborter = controller.clone();
        tasks.push(tokio::spawn(async move {
            aborter.abort(format!("abort-{}", index)).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(probe.abort_count(), 1);
    assert_eq!(handler.aborted_count(), 1);
    assert_eq!(controller.lifecycle(), InstanceLifecycle::Aborted);

    let err = controller.run(T).await.unwrap_err();
    assert!(matches!(err, ControlError::Aborted(_)));
}

#[tokio::test]
async fn test_concurrent_terminates_record_exactly_one_reason() {
    let handler = CountingHandler::new();
    let (controller, probe) = controller_with(vec![EngineStep::bookmark("B")], handler.clone());
    controller.run(T).await.unwrap();

    let first = controller.clone();
    let second = controller.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.terminate("reason-a", T).await }),
        tokio::spawn(async move { second.terminate("reason-b", T).await }),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    assert_eq!(probe.terminate_count(), 1);
    let reason = controller.termination_reason().expect("one reason recorded");
    assert!(reason == "reason-a" || reason == "reason-b");

    assert_eq!(handler.completed_count(), 1);
    let outcome = controller.completion_outcome().unwrap();
    assert_eq!(outcome.completion, ActivityCompletion::Faulted);
}

#[tokio::test]
async fn test_unhandled_exception_defaults_to_terminate() {
    let handler = CountingHandler::new();
    let (controller, probe) = controller_with(vec![], handler.clone());
    probe.fault_next_run(EngineFault::from_activity("activity blew up", "Step1"));

    controller.run(T).await.unwrap();

    assert_eq!(handler.exception_count(), 1);
    assert_eq!(probe.terminate_count(), 1);
    assert_eq!(handler.completed_count(), 1);
    let outcome = controller.completion_outcome().unwrap();
    assert_eq!(outcome.completion, ActivityCompletion::Faulted);
    assert_eq!(
        outcome.fault.map(|fault| fault.message),
        Some("activity blew up".to_string())
    );
}

#[tokio::test]
async fn test_unhandled_exception_abort_action_tears_down() {
    let handler = CountingHandler::with_actions(
        arbor_host::PersistableIdleAction::None,
        UnhandledExceptionAction::Abort,
    );
    let (controller, probe) = controller_with(vec![], handler.clone());
    probe.fault_next_run(EngineFault::new("fatal activity fault"));

    controller.run(T).await.unwrap();

    assert_eq!(handler.exception_count(), 1);
    assert_eq!(probe.abort_count(), 1);
    assert_eq!(handler.aborted_count(), 1);
    assert_eq!(handler.completed_count(), 0);
    assert_eq!(controller.lifecycle(), InstanceLifecycle::Aborted);
}

#[tokio::test]
async fn test_cancel_drives_a_canceled_completion() {
    let handler = CountingHandler::new();
    let (controller, _probe) = controller_with(vec![EngineStep::bookmark("B")], handler.clone());
    controller.run(T).await.unwrap();

    controller.cancel(T).await.unwrap();

    assert_eq!(handler.completed_count(), 1);
    let outcome = controller.completion_outcome().unwrap();
    assert_eq!(outcome.completion, ActivityCompletion::Canceled);
}

#[tokio::test]
async fn test_completion_event_emitted_to_observers() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let (engine, _probe) = ScriptedEngine::new(vec![EngineStep::complete()]);
    let controller = InstanceController::new(
        engine,
        InstanceOptions {
            event_tx: Some(tx),
            ..InstanceOptions::default()
        },
    );

    controller.run(T).await.unwrap();

    let event = rx.try_recv().expect("one event expected");
    assert!(matches!(
        event,
        arbor_host::InstanceEvent::Completed { .. }
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_outputs_surface_in_completion_outcome() {
    let handler = CountingHandler::new();
    let outputs = std::collections::HashMap::from([("total".to_string(), json!(99))]);
    let (controller, _probe) =
        controller_with(vec![EngineStep::complete_with(outputs)], handler.clone());

    controller.run(T).await.unwrap();

    let outcome = controller.completion_outcome().unwrap();
    assert_eq!(outcome.outputs["total"], json!(99));
}
