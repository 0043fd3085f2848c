#![allow(dead_code)]

use async_trait::async_trait;
use deskpilot::agent::{ActionError, ActionExecutor, AgentEvent, RunContext};
use deskpilot::llm::{ConversationTurn, ModelClient, NormalizedResponse, NormalizedToolCall, ProviderError, ProviderKind};
use deskpilot::screen::{CaptureFrame, PixelSource};
use image::{Rgb, RgbImage};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub fn args(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

pub fn click(x: i64, y: i64) -> NormalizedToolCall {
    NormalizedToolCall::new("left_click", args(serde_json::json!({ "x": x, "y": y })))
}

pub fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

/// What a scripted client saw on one call.
#[derive(Clone, Debug)]
pub struct SeenCall {
    pub history: Vec<ConversationTurn>,
    pub had_frame: bool,
}

/// Replays canned replies in order, then answers with a final text.
#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<NormalizedResponse, ProviderError>>>,
    seen: Mutex<Vec<SeenCall>>,
    stop_on_call: Mutex<Option<Arc<RunContext>>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Result<NormalizedResponse, ProviderError>>) -> Self {
        Self { replies: Mutex::new(replies.into()), ..Default::default() }
    }

    /// Requests a stop on `ctx` from inside the first call.
    pub fn stopping(self, ctx: Arc<RunContext>) -> Self {
        *self.stop_on_call.lock().unwrap() = Some(ctx);
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn submit(
        &self,
        history: &[ConversationTurn],
        frame: Option<&CaptureFrame>,
    ) -> Result<NormalizedResponse, ProviderError> {
        self.seen.lock().unwrap().push(SeenCall { history: history.to_vec(), had_frame: frame.is_some() });
        if let Some(ctx) = self.stop_on_call.lock().unwrap().take() {
            ctx.request_stop();
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(NormalizedResponse::text("done")))
    }
}

/// Never finishes on its own: every reply asks for another click.
#[derive(Default)]
pub struct AlwaysClicking {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ModelClient for AlwaysClicking {
    async fn submit(
        &self,
        _history: &[ConversationTurn],
        _frame: Option<&CaptureFrame>,
    ) -> Result<NormalizedResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(NormalizedResponse::calls(vec![click(10, 10)]))
    }
}

pub fn parse_failure() -> ProviderError {
    ProviderError::parse(ProviderKind::OpenAi, "reply has no choices[0].message")
}

/// Records every action; fails the ones named in `failing`.
#[derive(Default)]
pub struct RecordingExecutor {
    performed: Mutex<Vec<(String, Map<String, Value>)>>,
    failing: Vec<String>,
}

impl RecordingExecutor {
    pub fn failing(names: &[&str]) -> Self {
        Self { failing: names.iter().map(|n| n.to_string()).collect(), ..Default::default() }
    }

    pub fn performed(&self) -> Vec<(String, Map<String, Value>)> {
        self.performed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn perform(&self, name: &str, args: &Map<String, Value>) -> Result<String, ActionError> {
        self.performed.lock().unwrap().push((name.to_string(), args.clone()));
        if self.failing.iter().any(|f| f == name) {
            return Err(ActionError::new(name, "device unplugged"));
        }
        Ok(format!("{name} ok"))
    }
}

/// Gray frame of a fixed size; counts captures.
#[derive(Default)]
pub struct SyntheticScreen {
    pub captures: AtomicUsize,
}

#[async_trait]
impl PixelSource for SyntheticScreen {
    async fn capture(&self, _monitor: usize, _max_width: u32, _max_height: u32) -> Option<CaptureFrame> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Some(CaptureFrame::new(RgbImage::from_pixel(128, 80, Rgb([90, 90, 90]))))
    }
}

/// A screen that can never be captured.
pub struct DarkScreen;

#[async_trait]
impl PixelSource for DarkScreen {
    async fn capture(&self, _monitor: usize, _max_width: u32, _max_height: u32) -> Option<CaptureFrame> {
        None
    }
}
