use crate::llm::{
    arguments_from_str, encode_frame, post_json, render_history, system_prompt, tool_specs, ConversationTurn,
    NormalizedResponse, NormalizedToolCall, ProviderConfig, ProviderError, ProviderKind, Role, FRAME_CAPTION,
};
use crate::screen::CaptureFrame;
use serde_json::{json, Value};
use tracing::{info, warn};

const KIND: ProviderKind = ProviderKind::OpenAi;

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    cfg: ProviderConfig,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    pub fn build_request(&self, history: &[ConversationTurn], frame_png_b64: Option<&str>) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": system_prompt(&self.cfg.model) })];
        let mut rendered = render_history(history);

        // the live frame rides on the trailing user message
        let mut image_text = None;
        if frame_png_b64.is_some() {
            image_text = match rendered.last() {
                Some((Role::User, _)) => rendered.pop().map(|(_, text)| text),
                _ => Some(String::new()),
            };
        }
        for (role, text) in rendered {
            messages.push(json!({ "role": role_name(role), "content": text }));
        }
        if let (Some(b64), Some(text)) = (frame_png_b64, image_text) {
            let mut content = Vec::new();
            if !text.is_empty() {
                content.push(json!({ "type": "text", "text": text }));
            }
            content.push(json!({ "type": "text", "text": FRAME_CAPTION }));
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{b64}"), "detail": "high" }
            }));
            messages.push(json!({ "role": "user", "content": content }));
        }

        let tools: Vec<Value> = tool_specs()
            .into_iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": { "name": t.name, "description": t.description, "parameters": t.parameters }
                })
            })
            .collect();

        json!({
            "model": self.cfg.model,
            "messages": messages,
            "tools": tools,
            "tool_choice": "auto",
            "max_tokens": self.cfg.max_output_tokens,
        })
    }

    pub fn parse_reply(raw: Value) -> Result<NormalizedResponse, ProviderError> {
        let message = raw
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::parse(KIND, "reply has no choices[0].message"))?;

        let mut resp = NormalizedResponse::default();
        if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
            resp.push_text(text);
        }
        if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let name = call
                    .pointer("/function/name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| ProviderError::parse(KIND, "tool call without a function name"))?;
                let raw_args = call.pointer("/function/arguments").and_then(|a| a.as_str()).unwrap_or("");
                let arguments = arguments_from_str(raw_args);
                if arguments.is_empty() && !raw_args.trim().is_empty() && raw_args.trim() != "{}" {
                    warn!(tool = name, "unparseable tool arguments, using none");
                }
                let mut normalized = NormalizedToolCall::new(name, arguments);
                if let Some(id) = call.get("id").and_then(|i| i.as_str()) {
                    normalized = normalized.with_id(id);
                }
                resp.tool_calls.push(normalized);
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
        info!(model = %self.cfg.model, turns = history.len(), with_frame = image.is_some(), "calling openai");
        let request = self
            .http
            .post(self.cfg.endpoint("chat/completions"))
            .bearer_auth(&self.cfg.api_key)
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
