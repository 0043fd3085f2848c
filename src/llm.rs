use crate::action::ActionKind;
use crate::anthropic::AnthropicClient;
use crate::gemini::GeminiClient;
use crate::openai::OpenAiClient;
use crate::screen::{CaptureFrame, FrameRef};
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

// ========================= Conversation =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub call: NormalizedToolCall,
    pub output: String,
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnPart {
    Text { text: String },
    Frame { frame: FrameRef },
    ToolCalls { calls: Vec<NormalizedToolCall> },
    ActionResult { record: ActionRecord },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub parts: Vec<TurnPart>,
}

impl ConversationTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: Role::User, parts: vec![TurnPart::Text { text: text.into() }] }
    }

    pub fn assistant(text: Option<String>, calls: Vec<NormalizedToolCall>) -> Self {
        let mut parts = Vec::new();
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            parts.push(TurnPart::Text { text });
        }
        if !calls.is_empty() {
            parts.push(TurnPart::ToolCalls { calls });
        }
        Self { role: Role::Assistant, parts }
    }

    pub fn action_result(record: ActionRecord) -> Self {
        Self { role: Role::User, parts: vec![TurnPart::ActionResult { record }] }
    }

    pub fn is_action_result(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, TurnPart::ActionResult { .. }))
    }

    pub fn attach_frame(&mut self, frame: FrameRef) {
        self.parts.push(TurnPart::Frame { frame });
    }

    /// Plain-text rendering shared by every backend. Frames are left out;
    /// only the live capture travels, inline, with the request.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for part in &self.parts {
            match part {
                TurnPart::Text { text } => lines.push(text.clone()),
                TurnPart::Frame { .. } => {}
                TurnPart::ToolCalls { calls } => {
                    for call in calls {
                        lines.push(format!("-> {} {}", call.name, Value::Object(call.arguments.clone())));
                    }
                }
                TurnPart::ActionResult { record } => {
                    let status = if record.ok { "" } else { " failed" };
                    lines.push(format!("[{}{}] {}", record.call.name, status, record.output));
                }
            }
        }
        lines.join("\n")
    }
}

/// History flattened into alternating role/text pairs. Adjacent turns of the
/// same role are merged, which keeps every backend's alternation rules happy.
pub(crate) fn render_history(history: &[ConversationTurn]) -> Vec<(Role, String)> {
    let mut out: Vec<(Role, String)> = Vec::new();
    for turn in history {
        let text = turn.render();
        if text.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some((role, acc)) if *role == turn.role => {
                acc.push('\n');
                acc.push_str(&text);
            }
            _ => out.push((turn.role, text)),
        }
    }
    out
}

// ========================= Normalized Contract =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl NormalizedToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self { name: name.into(), arguments, id: None }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn kind(&self) -> Option<ActionKind> {
        ActionKind::from_name(&self.name)
    }
}

#[derive(Clone, Debug, Default)]
pub struct NormalizedResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<NormalizedToolCall>,
    pub raw: Value,
}

impl NormalizedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }

    pub fn calls(calls: Vec<NormalizedToolCall>) -> Self {
        Self { tool_calls: calls, ..Default::default() }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }

    pub(crate) fn push_text(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        match &mut self.text {
            Some(text) => text.push_str(fragment),
            None => self.text = Some(fragment.to_string()),
        }
    }
}

pub(crate) fn arguments_from_value(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub(crate) fn arguments_from_str(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    serde_json::from_str(raw).map(arguments_from_value).unwrap_or_default()
}

// ========================= Errors =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(ConfigurationError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no provider configured")]
    NoProvider,
    #[error("unknown provider `{0}` (expected openai, anthropic or gemini)")]
    UnknownProvider(String),
    #[error("{0} API key is missing")]
    MissingKey(ProviderKind),
    #[error("failed to build HTTP client for {provider}: {source}")]
    Client {
        provider: ProviderKind,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProviderFailure {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed reply: {0}")]
    Parse(String),
    #[error("could not encode screenshot: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
#[error("{provider} request failed: {cause}")]
pub struct ProviderError {
    pub provider: ProviderKind,
    #[source]
    pub cause: ProviderFailure,
}

impl ProviderError {
    pub fn new(provider: ProviderKind, cause: ProviderFailure) -> Self {
        Self { provider, cause }
    }

    pub fn parse(provider: ProviderKind, msg: impl Into<String>) -> Self {
        Self::new(provider, ProviderFailure::Parse(msg.into()))
    }
}

// ========================= Configuration =========================

pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1024;

#[derive(Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub max_output_tokens: u32,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, api_key: impl Into<String>) -> Self {
        let (model, api_base) = match kind {
            ProviderKind::OpenAi => ("gpt-4o", "https://api.openai.com/v1"),
            ProviderKind::Anthropic => ("claude-sonnet-4-20250514", "https://api.anthropic.com/v1"),
            ProviderKind::Gemini => ("gemini-2.0-flash", "https://generativelanguage.googleapis.com/v1beta"),
        };
        Self {
            kind,
            api_key: api_key.into(),
            model: model.to_string(),
            api_base: api_base.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// `DESKPILOT_PROVIDER` picks the backend; its key, and optionally model
    /// and base URL, come from the vendor's usual variables.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let kind: ProviderKind = env::var("DESKPILOT_PROVIDER")
            .map_err(|_| ConfigurationError::NoProvider)?
            .parse()?;
        let prefix = match kind {
            ProviderKind::OpenAi => "OPENAI",
            ProviderKind::Anthropic => "ANTHROPIC",
            ProviderKind::Gemini => "GEMINI",
        };
        let api_key = env::var(format!("{prefix}_API_KEY")).unwrap_or_default();
        let mut cfg = Self::new(kind, api_key);
        if let Ok(model) = env::var(format!("{prefix}_MODEL")) {
            cfg.model = model;
        }
        if let Ok(base) = env::var(format!("{prefix}_BASE_URL")) {
            cfg.api_base = base;
        }
        Ok(cfg)
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

// ========================= Tool Schema & Prompt =========================

#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

fn optional_point() -> Value {
    json!({
        "type": "object",
        "properties": {
            "x": { "type": "integer", "description": "Optional X coordinate in pixels" },
            "y": { "type": "integer", "description": "Optional Y coordinate in pixels" }
        }
    })
}

pub fn tool_specs() -> Vec<ToolSpec> {
    ActionKind::ALL
        .into_iter()
        .map(|kind| {
            let (description, parameters) = match kind {
                ActionKind::MouseMove => (
                    "Move the mouse pointer to screen coordinates (x, y). The origin is the top-left corner.",
                    json!({
                        "type": "object",
                        "properties": {
                            "x": { "type": "integer", "description": "Target X coordinate in pixels" },
                            "y": { "type": "integer", "description": "Target Y coordinate in pixels" }
                        },
                        "required": ["x", "y"]
                    }),
                ),
                ActionKind::LeftClick => (
                    "Left-click at the current pointer position, or move to (x, y) first if given.",
                    optional_point(),
                ),
                ActionKind::RightClick => (
                    "Right-click at the current pointer position, or at (x, y) if given.",
                    optional_point(),
                ),
                ActionKind::DoubleClick => (
                    "Double-click at the current pointer position, or at (x, y) if given.",
                    optional_point(),
                ),
                ActionKind::Scroll => (
                    "Scroll the mouse wheel. Positive amounts scroll up, negative amounts scroll down.",
                    json!({
                        "type": "object",
                        "properties": {
                            "amount": { "type": "integer", "description": "Scroll amount; positive is up" }
                        },
                        "required": ["amount"]
                    }),
                ),
                ActionKind::Type => (
                    "Type text at the focused element.",
                    json!({
                        "type": "object",
                        "properties": {
                            "text": { "type": "string", "description": "Text to type" }
                        },
                        "required": ["text"]
                    }),
                ),
                ActionKind::Key => (
                    "Press a single special key such as Enter, Tab or Escape.",
                    json!({
                        "type": "object",
                        "properties": {
                            "key_name": { "type": "string", "description": "Key name, e.g. 'enter', 'tab', 'escape', 'backspace'" }
                        },
                        "required": ["key_name"]
                    }),
                ),
                ActionKind::Hotkey => (
                    "Press a key combination such as Ctrl+C.",
                    json!({
                        "type": "object",
                        "properties": {
                            "keys": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Keys pressed together, e.g. ['ctrl', 'c']"
                            }
                        },
                        "required": ["keys"]
                    }),
                ),
            };
            ToolSpec { name: kind.as_str(), description, parameters }
        })
        .collect()
}

pub fn system_prompt(model: &str) -> String {
    format!(
        "You are an assistant that operates the user's computer. The model answering is {model}; \
say so if asked.\n\n\
You receive screenshots of the user's screen and act through these tools:\n\
- mouse_move: move the pointer to a coordinate\n\
- left_click / right_click / double_click: click, optionally at a coordinate\n\
- scroll: turn the mouse wheel\n\
- type: type text\n\
- key: press a special key\n\
- hotkey: press a key combination\n\n\
Work in small steps: study the screenshot, decide the next action, then wait for the next \
screenshot to confirm the result. Coordinates are pixels from the top-left corner of the \
screenshot. When the task is complete, reply with a short summary and call no tools."
    )
}

pub(crate) const FRAME_CAPTION: &str =
    "This is the current screenshot. Decide the next action based on it and the instructions so far.";

// ========================= Shared HTTP =========================

pub(crate) async fn post_json(provider: ProviderKind, request: RequestBuilder) -> Result<Value, ProviderError> {
    let resp = request
        .send()
        .await
        .map_err(|e| ProviderError::new(provider, ProviderFailure::Transport(e)))?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| ProviderError::new(provider, ProviderFailure::Transport(e)))?;
    if !status.is_success() {
        error!(%provider, status = status.as_u16(), "provider returned an error status");
        return Err(ProviderError::new(
            provider,
            ProviderFailure::Status { status: status.as_u16(), body: text },
        ));
    }
    debug!(%provider, bytes = text.len(), "provider reply received");
    serde_json::from_str(&text).map_err(|e| ProviderError::parse(provider, format!("invalid JSON: {e}")))
}

pub(crate) fn encode_frame(provider: ProviderKind, frame: Option<&CaptureFrame>) -> Result<Option<String>, ProviderError> {
    frame
        .map(|f| f.to_png_base64())
        .transpose()
        .map_err(|e| ProviderError::new(provider, ProviderFailure::Encode(e.to_string())))
}

// ========================= Provider =========================

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn submit(
        &self,
        history: &[ConversationTurn],
        frame: Option<&CaptureFrame>,
    ) -> Result<NormalizedResponse, ProviderError>;

    fn describe(&self) -> String {
        "model".to_string()
    }
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn submit(
        &self,
        history: &[ConversationTurn],
        frame: Option<&CaptureFrame>,
    ) -> Result<NormalizedResponse, ProviderError> {
        (**self).submit(history, frame).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[derive(Clone)]
pub enum Provider {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
    Gemini(GeminiClient),
}

impl Provider {
    pub fn from_config(cfg: ProviderConfig) -> Result<Self, ConfigurationError> {
        if cfg.api_key.trim().is_empty() {
            return Err(ConfigurationError::MissingKey(cfg.kind));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| ConfigurationError::Client { provider: cfg.kind, source })?;
        Ok(match cfg.kind {
            ProviderKind::OpenAi => Provider::OpenAi(OpenAiClient::new(http, cfg)),
            ProviderKind::Anthropic => Provider::Anthropic(AnthropicClient::new(http, cfg)),
            ProviderKind::Gemini => Provider::Gemini(GeminiClient::new(http, cfg)),
        })
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::OpenAi(_) => ProviderKind::OpenAi,
            Provider::Anthropic(_) => ProviderKind::Anthropic,
            Provider::Gemini(_) => ProviderKind::Gemini,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Provider::OpenAi(c) => c.model(),
            Provider::Anthropic(c) => c.model(),
            Provider::Gemini(c) => c.model(),
        }
    }

    pub async fn submit(
        &self,
        history: &[ConversationTurn],
        frame: Option<&CaptureFrame>,
    ) -> Result<NormalizedResponse, ProviderError> {
        match self {
            Provider::OpenAi(c) => c.submit(history, frame).await,
            Provider::Anthropic(c) => c.submit(history, frame).await,
            Provider::Gemini(c) => c.submit(history, frame).await,
        }
    }
}

#[async_trait]
impl ModelClient for Provider {
    async fn submit(
        &self,
        history: &[ConversationTurn],
        frame: Option<&CaptureFrame>,
    ) -> Result<NormalizedResponse, ProviderError> {
        Provider::submit(self, history, frame).await
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.kind(), self.model())
    }
}
