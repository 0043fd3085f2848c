use crate::action::DeviceAction;
use crate::cache::{CacheConfig, CacheStats};
use crate::llm::{ActionRecord, ConversationTurn, ModelClient, Role};
use crate::screen::{PixelSource, Screen, ScreenConfig};
use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

// ========================= Events =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Action,
    Error,
    Warning,
    Status,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Info => "info",
            EventKind::Action => "action",
            EventKind::Error => "error",
            EventKind::Warning => "warning",
            EventKind::Status => "status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(EventKind::Info),
            "action" => Ok(EventKind::Action),
            "error" => Ok(EventKind::Error),
            "warning" => Ok(EventKind::Warning),
            "status" => Ok(EventKind::Status),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: EventKind,
    pub message: String,
}

const EVENT_CAPACITY: usize = 256;

/// Best-effort fan-out of progress events. Slow subscribers lose the oldest
/// events; with no subscribers events are only logged.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            EventKind::Error => error!(kind = %kind, "{}", message),
            EventKind::Warning => warn!(kind = %kind, "{}", message),
            _ => info!(kind = %kind, "{}", message),
        }
        // no receivers is fine
        let _ = self.tx.send(AgentEvent { kind, message });
    }
}

// ========================= Run State =========================

#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Budget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Stopped,
    Failed(FailureKind),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Stopped => f.write_str("stopped"),
            RunOutcome::Failed(FailureKind::Error) => f.write_str("failed (error)"),
            RunOutcome::Failed(FailureKind::Budget) => f.write_str("failed (budget)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Completed,
    Failed(FailureKind),
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub is_running: bool,
    pub current_task: Option<String>,
    pub iteration: u32,
    pub last_outcome: Option<RunOutcome>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("a task is already running: {0}")]
    Busy(String),
}

#[derive(Debug)]
struct RunSlot {
    state: RunState,
    task: Option<String>,
    iteration: u32,
    last_outcome: Option<RunOutcome>,
}

/// State shared between a running loop and whoever controls it.
pub struct RunContext {
    slot: Mutex<RunSlot>,
    stop: StopSignal,
    events: EventBus,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

impl RunContext {
    pub fn new(events: EventBus) -> Self {
        Self {
            slot: Mutex::new(RunSlot { state: RunState::Idle, task: None, iteration: 0, last_outcome: None }),
            stop: StopSignal::default(),
            events,
        }
    }

    fn slot(&self) -> MutexGuard<'_, RunSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(self: &Arc<Self>, task: &str) -> Result<RunGuard, RunError> {
        {
            let mut slot = self.slot();
            if matches!(slot.state, RunState::Running | RunState::Stopping) {
                return Err(RunError::Busy(slot.task.clone().unwrap_or_default()));
            }
            slot.state = RunState::Running;
            slot.task = Some(task.to_string());
            slot.iteration = 0;
            // cleared at acceptance so a stop sent right after is kept
            self.stop.clear();
        }
        self.events.emit(EventKind::Status, format!("Task started: {task}"));
        Ok(RunGuard { ctx: Arc::clone(self), task: task.to_string(), settled: false })
    }

    pub fn request_stop(&self) -> bool {
        {
            let mut slot = self.slot();
            match slot.state {
                RunState::Running => {
                    slot.state = RunState::Stopping;
                    self.stop.set();
                }
                RunState::Stopping => return true,
                _ => return false,
            }
        }
        // announced on the Running -> Stopping edge only
        self.events.emit(EventKind::Status, "Stop requested");
        true
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn status(&self) -> RunStatus {
        let slot = self.slot();
        RunStatus {
            state: slot.state,
            is_running: matches!(slot.state, RunState::Running | RunState::Stopping),
            current_task: slot.task.clone(),
            iteration: slot.iteration,
            last_outcome: slot.last_outcome,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.events.emit(kind, message);
    }

    fn set_iteration(&self, iteration: u32) {
        self.slot().iteration = iteration;
    }

    fn settle(&self, outcome: Option<RunOutcome>) {
        let mut slot = self.slot();
        if let Some(outcome) = outcome {
            let terminal = match outcome {
                RunOutcome::Completed => RunState::Completed,
                RunOutcome::Stopped => RunState::Stopped,
                RunOutcome::Failed(kind) => RunState::Failed(kind),
            };
            info!(from = ?slot.state, to = ?terminal, iteration = slot.iteration, "run settled");
            slot.last_outcome = Some(outcome);
        }
        // terminal states fall straight back to idle
        slot.state = RunState::Idle;
        slot.task = None;
    }
}

/// Proof of a claimed run. Dropping it without `finish` releases the
/// context anyway.
pub struct RunGuard {
    ctx: Arc<RunContext>,
    task: String,
    settled: bool,
}

impl RunGuard {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn finish(mut self, outcome: RunOutcome) {
        self.settled = true;
        self.ctx.settle(Some(outcome));
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(task = %self.task, "run abandoned");
            self.ctx.settle(None);
        }
    }
}

// ========================= Action Execution =========================

#[derive(Debug, Error, Clone)]
#[error("{action} failed: {message}")]
pub struct ActionError {
    pub action: String,
    pub message: String,
}

impl ActionError {
    pub fn new(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self { action: action.into(), message: message.into() }
    }
}

/// Performs one named device action. Unknown names and refused actions come
/// back as a descriptive `Ok` string so the model can read them; `Err` is
/// for the device itself failing.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn perform(&self, name: &str, args: &Map<String, Value>) -> Result<String, ActionError>;
}

#[async_trait]
impl<T: ActionExecutor + ?Sized> ActionExecutor for Arc<T> {
    async fn perform(&self, name: &str, args: &Map<String, Value>) -> Result<String, ActionError> {
        (**self).perform(name, args).await
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn perform(&self, name: &str, args: &Map<String, Value>) -> Result<String, ActionError> {
        Ok(match DeviceAction::from_call(name, args) {
            Ok(action) => format!("(dry run) {}", action.describe()),
            Err(e) => e.to_string(),
        })
    }
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub monitor: usize,
    pub max_width: u32,
    pub max_height: u32,
    pub fresh_first_frame: bool,
    pub cache: CacheConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            monitor: 1,
            max_width: 1280,
            max_height: 800,
            fresh_first_frame: true,
            cache: CacheConfig::default(),
        }
    }
}

impl AgentConfig {
    fn screen(&self) -> ScreenConfig {
        ScreenConfig { monitor: self.monitor, max_width: self.max_width, max_height: self.max_height }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: String,
    pub outcome: RunOutcome,
    pub iterations: u32,
    pub provider_calls: u32,
    pub actions: Vec<ActionRecord>,
    pub history: Vec<ConversationTurn>,
    pub final_text: Option<String>,
    pub error: Option<String>,
    pub time_ms: u128,
}

pub struct Agent<E, S> {
    executor: E,
    screen: Screen<S>,
    cfg: AgentConfig,
    ctx: Arc<RunContext>,
}

impl<E, S> Agent<E, S>
where
    E: ActionExecutor,
    S: PixelSource,
{
    pub fn new(executor: E, source: S, cfg: AgentConfig) -> Self {
        Self::with_context(executor, source, cfg, Arc::new(RunContext::default()))
    }

    pub fn with_context(executor: E, source: S, cfg: AgentConfig, ctx: Arc<RunContext>) -> Self {
        let screen = Screen::new(source, cfg.screen(), cfg.cache.clone());
        Self { executor, screen, cfg, ctx }
    }

    pub fn context(&self) -> Arc<RunContext> {
        Arc::clone(&self.ctx)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.screen.cache_stats()
    }

    pub fn clear_cache(&mut self) {
        self.screen.clear_cache();
    }

    pub async fn run<M>(&mut self, client: &M, task: &str) -> Result<RunReport, RunError>
    where
        M: ModelClient + ?Sized,
    {
        let guard = self.ctx.begin(task)?;
        Ok(self.drive(guard, client).await)
    }

    pub(crate) async fn drive<M>(&mut self, guard: RunGuard, client: &M) -> RunReport
    where
        M: ModelClient + ?Sized,
    {
        debug_assert!(Arc::ptr_eq(&guard.ctx, &self.ctx), "run guard belongs to another context");
        let run_id = nanoid!();
        let start = Instant::now();
        let task = guard.task().to_string();
        let max = self.cfg.max_iterations;
        info!(run_id = %run_id, task = %task, max_iterations = max, model = %client.describe(), "run started");

        let mut history = vec![ConversationTurn::user_text(task.clone())];
        let mut actions: Vec<ActionRecord> = Vec::new();
        let mut iteration: u32 = 0;
        let mut provider_calls: u32 = 0;
        let mut final_text = None;
        let mut failure = None;

        let outcome = loop {
            if self.ctx.stop_requested() {
                self.ctx.emit(EventKind::Status, "Task stopped");
                break RunOutcome::Stopped;
            }
            if iteration >= max {
                self.ctx.emit(EventKind::Warning, format!("Reached maximum iterations ({max})"));
                break RunOutcome::Failed(FailureKind::Budget);
            }
            let force = iteration == 0 && self.cfg.fresh_first_frame;
            let frame = self.screen.frame(force).await;
            match &frame {
                Some(frame) => {
                    if let Some(turn) = history.iter_mut().rev().find(|t| t.role == Role::User) {
                        turn.attach_frame(frame.frame_ref());
                    }
                }
                None => self.ctx.emit(EventKind::Warning, "Screenshot unavailable, continuing without an image"),
            }

            provider_calls += 1;
            let response = match client.submit(&history, frame.as_deref()).await {
                Ok(response) => response,
                Err(e) => {
                    error!(run_id = %run_id, iteration, provider = %e.provider, "provider call failed: {}", e);
                    self.ctx.emit(EventKind::Error, format!("Provider error: {e}"));
                    failure = Some(e.to_string());
                    break RunOutcome::Failed(FailureKind::Error);
                }
            };

            if let Some(text) = response.text.as_deref().filter(|t| !t.trim().is_empty()) {
                self.ctx.emit(EventKind::Info, text);
            }
            if response.is_final() {
                history.push(ConversationTurn::assistant(response.text.clone(), Vec::new()));
                final_text = response.text;
                self.ctx.emit(EventKind::Status, "Task completed");
                break RunOutcome::Completed;
            }

            let calls = response.tool_calls;
            history.push(ConversationTurn::assistant(response.text, calls.clone()));
            for call in calls {
                let (output, ok) = match self.executor.perform(&call.name, &call.arguments).await {
                    Ok(output) => (output, true),
                    Err(e) => {
                        warn!(iteration, action = %call.name, "action failed: {}", e);
                        (e.to_string(), false)
                    }
                };
                info!(iteration, action = %call.name, ok, "action result: {}", output);
                self.ctx.emit(EventKind::Action, format!("{}: {}", call.name, output));
                let record = ActionRecord { call, output, ok };
                history.push(ConversationTurn::action_result(record.clone()));
                actions.push(record);
            }

            // counted once its actions are dispatched
            iteration += 1;
            self.ctx.set_iteration(iteration);
            if iteration >= max {
                self.ctx.emit(EventKind::Warning, format!("Reached maximum iterations ({max})"));
                break RunOutcome::Failed(FailureKind::Budget);
            }
        };

        let report = RunReport {
            run_id,
            task,
            outcome,
            iterations: iteration,
            provider_calls,
            actions,
            history,
            final_text,
            error: failure,
            time_ms: start.elapsed().as_millis(),
        };
        info!(
            run_id = %report.run_id,
            outcome = %report.outcome,
            iterations = report.iterations,
            actions = report.actions.len(),
            "run finished"
        );
        guard.finish(outcome);
        report
    }
}
