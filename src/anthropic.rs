use crate::llm::{
    arguments_from_value, encode_frame, post_json, render_history, system_prompt, tool_specs, ConversationTurn,
    NormalizedResponse, NormalizedToolCall, ProviderConfig, ProviderError, ProviderKind, Role, FRAME_CAPTION,
};
use crate::screen::CaptureFrame;
use serde_json::{json, Value};
use tracing::{debug, info};

const KIND: ProviderKind = ProviderKind::Anthropic;
const API_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    cfg: ProviderConfig,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    pub fn build_request(&self, history: &[ConversationTurn], frame_png_b64: Option<&str>) -> Value {
        let mut rendered = render_history(history);
        let mut trailing = None;
        if frame_png_b64.is_some() {
            trailing = match rendered.last() {
                Some((Role::User, _)) => rendered.pop().map(|(_, text)| text),
                _ => Some(String::new()),
            };
        }

        let mut messages: Vec<Value> = rendered
            .into_iter()
            .map(|(role, text)| {
                json!({
                    "role": role_name(role),
                    "content": [{ "type": "text", "text": text }]
                })
            })
            .collect();
        if let (Some(b64), Some(text)) = (frame_png_b64, trailing) {
            let mut content = Vec::new();
            if !text.is_empty() {
                content.push(json!({ "type": "text", "text": text }));
            }
            content.push(json!({ "type": "text", "text": FRAME_CAPTION }));
            content.push(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": "image/png", "data": b64 }
            }));
            messages.push(json!({ "role": "user", "content": content }));
        }

        let tools: Vec<Value> = tool_specs()
            .into_iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
            .collect();

        json!({
            "model": self.cfg.model,
            "max_tokens": self.cfg.max_output_tokens,
            "system": system_prompt(&self.cfg.model),
            "messages": messages,
            "tools": tools,
        })
    }

    /// Text blocks are concatenated in order; `tool_use` blocks become calls.
    pub fn parse_reply(raw: Value) -> Result<NormalizedResponse, ProviderError> {
        let blocks = raw
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| ProviderError::parse(KIND, "reply has no content array"))?;

        let mut resp = NormalizedResponse::default();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        resp.push_text(text);
                    }
                }
                Some("tool_use") => {
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| ProviderError::parse(KIND, "tool_use block without a name"))?;
                    let arguments = arguments_from_value(block.get("input").cloned().unwrap_or(Value::Null));
                    let mut call = NormalizedToolCall::new(name, arguments);
                    if let Some(id) = block.get("id").and_then(|i| i.as_str()) {
                        call = call.with_id(id);
                    }
                    resp.tool_calls.push(call);
                }
                other => debug!(block_type = ?other, "skipping content block"),
            }
        }
        resp.raw = raw;
        Ok(resp)
    }

    pub async fn submit(
        &self,
        history: &[ConversationTurn],
        frame: Option<&CaptureFrame>,
    ) -> Result<NormalizedResponse, ProviderError> {
        let image = encode_frame(KIND, frame)?;
        let body = self.build_request(history, image.as_deref());
        info!(model = %self.cfg.model, turns = history.len(), with_frame = image.is_some(), "calling anthropic");
        let request = self
            .http
            .post(self.cfg.endpoint("messages"))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        let raw = post_json(KIND, request).await?;
        Self::parse_reply(raw)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}
