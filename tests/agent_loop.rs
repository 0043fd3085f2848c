mod common;

use common::*;
use deskpilot::agent::{Agent, AgentConfig, EventKind, FailureKind, RunContext, RunError, RunOutcome, RunState};
use deskpilot::llm::{NormalizedResponse, TurnPart};
use deskpilot::openai::OpenAiClient;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn config(max_iterations: u32) -> AgentConfig {
    AgentConfig { max_iterations, ..Default::default() }
}

#[tokio::test]
async fn zero_tool_calls_completes_without_counting_an_iteration() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut agent = Agent::new(executor.clone(), SyntheticScreen::default(), config(20));
    let mut events = agent.context().subscribe();
    let client = ScriptedClient::new(vec![Ok(NormalizedResponse::text("Nothing to do, the window is already open."))]);

    let report = agent.run(&client, "open the window").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.iterations, 0);
    assert_eq!(report.provider_calls, 1);
    assert!(report.actions.is_empty());
    assert!(executor.performed().is_empty());
    assert_eq!(report.final_text.as_deref(), Some("Nothing to do, the window is already open."));

    let kinds: Vec<EventKind> = drain(&mut events).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [EventKind::Status, EventKind::Info, EventKind::Status]);

    let status = agent.context().status();
    assert_eq!(status.state, RunState::Idle);
    assert_eq!(status.last_outcome, Some(RunOutcome::Completed));
}

#[tokio::test]
async fn stop_during_first_call_stops_after_one_iteration() {
    let ctx = Arc::new(RunContext::default());
    let executor = Arc::new(RecordingExecutor::default());
    let mut agent = Agent::with_context(executor.clone(), SyntheticScreen::default(), config(20), ctx.clone());
    let mut events = ctx.subscribe();
    let client = ScriptedClient::new(vec![Ok(NormalizedResponse::calls(vec![click(5, 5)]))]).stopping(ctx.clone());

    let report = agent.run(&client, "click forever").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert_eq!(report.iterations, 1);
    assert_eq!(client.calls(), 1);
    assert_eq!(executor.performed().len(), 1);

    let statuses: Vec<String> =
        drain(&mut events).into_iter().filter(|e| e.kind == EventKind::Status).map(|e| e.message).collect();
    assert_eq!(statuses, ["Task started: click forever", "Stop requested", "Task stopped"]);
    assert_eq!(ctx.status().last_outcome, Some(RunOutcome::Stopped));
    assert!(!ctx.status().is_running);
}

#[tokio::test]
async fn budget_is_exhausted_after_exactly_max_iterations() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut agent = Agent::new(executor.clone(), SyntheticScreen::default(), config(3));
    let mut events = agent.context().subscribe();
    let client = AlwaysClicking::default();

    let report = agent.run(&client, "never done").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed(FailureKind::Budget));
    assert_eq!(report.iterations, 3);
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    assert_eq!(executor.performed().len(), 3);

    let events = drain(&mut events);
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Action).count(), 3);
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Error).count(), 0);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Warning);
    assert!(last.message.contains("maximum iterations"));
}

#[tokio::test]
async fn zero_budget_fails_without_calling_the_model() {
    let mut agent = Agent::new(RecordingExecutor::default(), SyntheticScreen::default(), config(0));
    let client = ScriptedClient::default();
    let report = agent.run(&client, "anything").await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Failed(FailureKind::Budget));
    assert_eq!(report.iterations, 0);
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn click_center_end_to_end() {
    let first = OpenAiClient::parse_reply(json!({
        "choices": [{ "message": {
            "content": "Clicking the center of the screen.",
            "tool_calls": [{
                "id": "call_a",
                "type": "function",
                "function": { "name": "left_click", "arguments": "{\"x\": 640, \"y\": 400}" }
            }]
        }}]
    }))
    .unwrap();
    let second = OpenAiClient::parse_reply(json!({
        "choices": [{ "message": { "content": "Clicked the center." } }]
    }))
    .unwrap();

    let executor = Arc::new(RecordingExecutor::default());
    let mut agent = Agent::new(executor.clone(), SyntheticScreen::default(), config(20));
    let client = ScriptedClient::new(vec![Ok(first), Ok(second)]);

    let report = agent.run(&client, "click the center of the screen").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(client.calls(), 2);
    assert_eq!(report.iterations, 1);

    let performed = executor.performed();
    assert_eq!(performed.len(), 1);
    assert_eq!(performed[0].0, "left_click");
    assert_eq!(performed[0].1.get("x"), Some(&json!(640)));
    assert_eq!(performed[0].1.get("y"), Some(&json!(400)));

    let result_turns = report.history.iter().filter(|t| t.is_action_result()).count();
    assert_eq!(result_turns, 1);

    // the second call sees the click's outcome
    let seen = client.seen();
    assert!(seen[1].history.iter().any(|t| t.is_action_result()));
    assert!(seen.iter().all(|s| s.had_frame));
    let task_turn = &seen[0].history[0];
    assert!(task_turn.parts.iter().any(|p| matches!(p, TurnPart::Frame { .. })));
}

#[tokio::test]
async fn parse_failure_fails_the_run_without_actions() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut agent = Agent::new(executor.clone(), SyntheticScreen::default(), config(20));
    let mut events = agent.context().subscribe();
    let client = ScriptedClient::new(vec![Err(parse_failure())]);

    let report = agent.run(&client, "do something").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed(FailureKind::Error));
    assert_eq!(client.calls(), 1);
    assert!(executor.performed().is_empty());
    assert!(report.error.as_deref().unwrap().contains("openai"));
    assert!(drain(&mut events).iter().any(|e| e.kind == EventKind::Error));
}

#[tokio::test]
async fn failing_action_is_recorded_and_run_continues() {
    let executor = Arc::new(RecordingExecutor::failing(&["type"]));
    let mut agent = Agent::new(executor.clone(), SyntheticScreen::default(), config(20));
    let calls = vec![
        deskpilot::llm::NormalizedToolCall::new("type", args(json!({ "text": "hello" }))),
        click(1, 2),
    ];
    let client = ScriptedClient::new(vec![Ok(NormalizedResponse::calls(calls))]);

    let report = agent.run(&client, "type hello").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.actions.len(), 2);
    assert!(!report.actions[0].ok);
    assert!(report.actions[0].output.contains("device unplugged"));
    assert!(report.actions[1].ok);
    // dispatched in list order
    let names: Vec<String> = executor.performed().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["type", "left_click"]);
}

#[tokio::test]
async fn missing_frame_warns_and_calls_without_image() {
    let mut agent = Agent::new(RecordingExecutor::default(), DarkScreen, config(20));
    let mut events = agent.context().subscribe();
    let client = ScriptedClient::default();

    let report = agent.run(&client, "look around").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(!client.seen()[0].had_frame);
    assert!(drain(&mut events).iter().any(|e| e.kind == EventKind::Warning));
}

#[tokio::test]
async fn first_iteration_forces_a_fresh_capture() {
    let screen = Arc::new(SyntheticScreen::default());
    let mut agent = Agent::new(RecordingExecutor::default(), screen.clone(), config(20));

    let client = ScriptedClient::new(vec![Ok(NormalizedResponse::calls(vec![click(3, 3)]))]);
    agent.run(&client, "first").await.unwrap();
    // second iteration reused the cached frame
    assert_eq!(screen.captures.load(Ordering::SeqCst), 1);
    assert_eq!(agent.cache_stats().hits, 1);

    agent.run(&ScriptedClient::default(), "second").await.unwrap();
    assert_eq!(screen.captures.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn busy_context_rejects_a_second_run() {
    let ctx = Arc::new(RunContext::default());
    let mut agent = Agent::with_context(RecordingExecutor::default(), SyntheticScreen::default(), config(20), ctx.clone());
    let _held = ctx.begin("already running").unwrap();

    let err = agent.run(&ScriptedClient::default(), "another").await.unwrap_err();
    assert_eq!(err, RunError::Busy("already running".into()));
}
