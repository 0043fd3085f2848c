use anyhow::Result;
use deskpilot::agent::EventKind;
use deskpilot::{Agent, AgentConfig, BrowserDesktop, BrowserDesktopConfig, EnvConfigStore, TaskController};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = BrowserDesktopConfig {
        headless: false,
        start_url: std::env::var("DESKPILOT_START_URL").unwrap_or_else(|_| "https://example.com".to_string()),
        ..Default::default()
    };
    let desktop = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => BrowserDesktop::connect(&ws, cfg).await?,
        _ => BrowserDesktop::launch(cfg).await?,
    };
    let desktop = Arc::new(desktop);

    // the page is both the screen and the input device
    let agent = Agent::new(desktop.clone(), desktop, AgentConfig::default());
    let controller = TaskController::new(agent, Arc::new(EnvConfigStore));

    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) if ev.kind == EventKind::Error => eprintln!("[{}] {}", ev.kind, ev.message),
                Ok(ev) => println!("[{}] {}", ev.kind, ev.message),
                Err(RecvError::Lagged(n)) => println!("(missed {n} events)"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let task = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Click the 'More information...' link and tell me where it leads.".to_string());
    controller.submit_task(&task)?;

    if let Some(report) = controller.wait().await {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({
            "run_id": report.run_id,
            "outcome": report.outcome,
            "iterations": report.iterations,
            "actions": report.actions.len(),
            "final_text": report.final_text,
        }))?);
    }
    // closes the event channel so the printer drains and exits
    drop(controller);
    printer.await?;
    Ok(())
}
