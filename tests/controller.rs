mod common;

use common::*;
use deskpilot::agent::{Agent, AgentConfig, EventKind, RunOutcome, RunState};
use deskpilot::llm::{ConfigurationError, NormalizedResponse, ProviderKind};
use deskpilot::screen::BlankScreen;
use deskpilot::session::{MemoryConfigStore, SubmitError, TaskController};
use std::sync::Arc;

fn controller(
    store: Arc<MemoryConfigStore>,
) -> (TaskController<Arc<RecordingExecutor>, BlankScreen>, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::default());
    let agent = Agent::new(executor.clone(), BlankScreen::default(), AgentConfig::default());
    (TaskController::new(agent, store), executor)
}

#[tokio::test]
async fn submitted_task_runs_in_background() {
    let (controller, executor) = controller(Arc::new(MemoryConfigStore::new()));
    let mut events = controller.subscribe();
    let client = ScriptedClient::new(vec![
        Ok(NormalizedResponse::calls(vec![click(640, 360)])),
        Ok(NormalizedResponse::text("Done.")),
    ]);

    controller.submit_with("click the middle", client).unwrap();
    let status = controller.status();
    assert!(status.is_running);
    assert_eq!(status.current_task.as_deref(), Some("click the middle"));

    let report = controller.wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(executor.performed().len(), 1);

    let status = controller.status();
    assert_eq!(status.state, RunState::Idle);
    assert!(!status.is_running);
    assert_eq!(status.last_outcome, Some(RunOutcome::Completed));

    let events = drain(&mut events);
    assert_eq!(events.first().unwrap().kind, EventKind::Status);
    assert!(events.iter().any(|e| e.kind == EventKind::Action));
    assert_eq!(events.last().unwrap().message, "Task completed");
}

#[tokio::test]
async fn second_submission_while_running_is_busy() {
    let (controller, _) = controller(Arc::new(MemoryConfigStore::new()));
    controller.submit_with("first", ScriptedClient::default()).unwrap();

    let err = controller.submit_with("second", ScriptedClient::default()).unwrap_err();
    assert!(matches!(err, SubmitError::Busy(ref task) if task == "first"));

    let report = controller.wait().await.unwrap();
    assert_eq!(report.task, "first");

    // free again once the first run settled
    controller.submit_with("second", ScriptedClient::default()).unwrap();
    assert_eq!(controller.wait().await.unwrap().task, "second");
}

#[tokio::test]
async fn stop_right_after_submit_is_not_lost() {
    let (controller, executor) = controller(Arc::new(MemoryConfigStore::new()));
    controller
        .submit_with("keep clicking", ScriptedClient::new(vec![Ok(NormalizedResponse::calls(vec![click(1, 1)]))]))
        .unwrap();
    assert!(controller.request_stop());
    assert_eq!(controller.status().state, RunState::Stopping);

    let report = controller.wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert_eq!(report.iterations, 0);
    assert_eq!(report.provider_calls, 0);
    assert!(executor.performed().is_empty());
}

#[tokio::test]
async fn stop_request_is_announced_once() {
    let (controller, _) = controller(Arc::new(MemoryConfigStore::new()));
    let mut events = controller.subscribe();
    controller
        .submit_with("keep clicking", ScriptedClient::new(vec![Ok(NormalizedResponse::calls(vec![click(1, 1)]))]))
        .unwrap();
    assert!(controller.request_stop());
    // already stopping: still true, nothing new announced
    assert!(controller.request_stop());
    controller.wait().await.unwrap();

    let seen: Vec<(EventKind, String)> = drain(&mut events).into_iter().map(|e| (e.kind, e.message)).collect();
    assert_eq!(
        seen,
        [
            (EventKind::Status, "Task started: keep clicking".to_string()),
            (EventKind::Status, "Stop requested".to_string()),
            (EventKind::Status, "Task stopped".to_string()),
        ]
    );
}

#[tokio::test]
async fn stop_without_a_run_is_a_no_op() {
    let (controller, _) = controller(Arc::new(MemoryConfigStore::new()));
    assert!(!controller.request_stop());
    assert_eq!(controller.status().state, RunState::Idle);
}

#[tokio::test]
async fn missing_configuration_is_rejected_before_any_run() {
    let store = Arc::new(MemoryConfigStore::new());
    let (controller, _) = controller(store.clone());

    let err = controller.submit_task("open the browser").unwrap_err();
    assert!(matches!(err, SubmitError::Configuration(ConfigurationError::NoProvider)));
    assert!(!controller.status().is_running);
    assert!(controller.wait().await.is_none());

    assert!(store.set("watson", "key").is_err());
    let err = controller.submit_task("open the browser").unwrap_err();
    assert!(matches!(err, SubmitError::Configuration(ConfigurationError::NoProvider)));
}

#[tokio::test]
async fn configured_provider_is_used_for_submission() {
    let store = Arc::new(MemoryConfigStore::new());
    // unreachable base URL: the run fails at the provider call, not at submission
    store.set_config(
        deskpilot::llm::ProviderConfig::new(ProviderKind::OpenAi, "sk-test").with_api_base("http://127.0.0.1:9"),
    );
    let (controller, executor) = controller(store);

    controller.submit_task("open the browser").unwrap();
    let report = controller.wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Failed(deskpilot::agent::FailureKind::Error));
    assert_eq!(report.provider_calls, 1);
    assert!(executor.performed().is_empty());
}

#[tokio::test]
async fn empty_task_is_rejected() {
    let (controller, _) = controller(Arc::new(MemoryConfigStore::new()));
    assert!(matches!(controller.submit_with("   ", ScriptedClient::default()), Err(SubmitError::EmptyTask)));
}
