use crate::llm::{
    arguments_from_value, encode_frame, post_json, render_history, system_prompt, tool_specs, ConversationTurn,
    NormalizedResponse, NormalizedToolCall, ProviderConfig, ProviderError, ProviderKind, Role, FRAME_CAPTION,
};
use crate::screen::CaptureFrame;
use serde_json::{json, Value};
use tracing::{info, warn};

const KIND: ProviderKind = ProviderKind::Gemini;
const TEMPERATURE: f64 = 0.7;

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    cfg: ProviderConfig,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    pub fn build_request(&self, history: &[ConversationTurn], frame_png_b64: Option<&str>) -> Value {
        let mut contents: Vec<Value> = render_history(history)
            .into_iter()
            .map(|(role, text)| json!({ "role": role_name(role), "parts": [{ "text": text }] }))
            .collect();

        if let Some(b64) = frame_png_b64 {
            let frame_parts = [
                json!({ "text": FRAME_CAPTION }),
                json!({ "inlineData": { "mimeType": "image/png", "data": b64 } }),
            ];
            let trailing_user = contents
                .last_mut()
                .filter(|c| c["role"] == "user")
                .and_then(|c| c.get_mut("parts"))
                .and_then(|p| p.as_array_mut());
            match trailing_user {
                Some(parts) => parts.extend(frame_parts),
                None => contents.push(json!({ "role": "user", "parts": frame_parts })),
            }
        }

        let declarations: Vec<Value> = tool_specs()
            .into_iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters }))
            .collect();

        json!({
            "systemInstruction": { "parts": [{ "text": system_prompt(&self.cfg.model) }] },
            "contents": contents,
            "tools": [{ "functionDeclarations": declarations }],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": self.cfg.max_output_tokens,
            },
        })
    }

    /// Reads the first candidate. A reply with no candidates (safety block,
    /// empty generation) is an empty, final response rather than an error.
    pub fn parse_reply(raw: Value) -> Result<NormalizedResponse, ProviderError> {
        let candidates = match raw.get("candidates") {
            None | Some(Value::Null) => {
                warn!(feedback = ?raw.get("promptFeedback"), "gemini returned no candidates");
                return Ok(NormalizedResponse { raw, ..Default::default() });
            }
            Some(Value::Array(c)) => c,
            Some(_) => return Err(ProviderError::parse(KIND, "candidates is not an array")),
        };
        let Some(parts) = candidates
            .first()
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(|p| p.as_array())
        else {
            warn!("gemini candidate has no content parts");
            return Ok(NormalizedResponse { raw, ..Default::default() });
        };

        let mut resp = NormalizedResponse::default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                resp.push_text(text);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| ProviderError::parse(KIND, "functionCall without a name"))?;
                let arguments = arguments_from_value(call.get("args").cloned().unwrap_or(Value::Null));
                // gemini does not assign call ids
                resp.tool_calls.push(NormalizedToolCall::new(name, arguments));
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
        info!(model = %self.cfg.model, turns = history.len(), with_frame = image.is_some(), "calling gemini");
        let url = self.cfg.endpoint(&format!("models/{}:generateContent", self.cfg.model));
        let request = self
            .http
            .post(url)
            .query(&[("key", self.cfg.api_key.as_str())])
            .json(&body);
        let raw = post_json(KIND, request).await?;
        Self::parse_reply(raw)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_text_and_function_calls() {
        let raw = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "Scrolling down." },
                        { "functionCall": { "name": "scroll", "args": { "amount": -3 } } }
                    ]
                }
            }]
        });
        let resp = GeminiClient::parse_reply(raw).unwrap();
        assert_eq!(resp.text.as_deref(), Some("Scrolling down."));
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "scroll");
        assert_eq!(resp.tool_calls[0].id, None);
        assert_eq!(resp.tool_calls[0].arguments.get("amount"), Some(&json!(-3)));
    }

    #[test]
    fn test_no_candidates_is_empty_and_final() {
        let resp = GeminiClient::parse_reply(json!({ "promptFeedback": { "blockReason": "SAFETY" } })).unwrap();
        assert!(resp.text.is_none());
        assert!(resp.is_final());

        let resp = GeminiClient::parse_reply(json!({ "candidates": [] })).unwrap();
        assert!(resp.is_final());
    }

    #[test]
    fn test_candidates_of_wrong_type_is_a_parse_error() {
        assert!(GeminiClient::parse_reply(json!({ "candidates": "oops" })).is_err());
    }

    #[test]
    fn test_missing_args_become_empty() {
        let raw = json!({ "candidates": [{ "content": { "parts": [{ "functionCall": { "name": "left_click" } }] } }] });
        let resp = GeminiClient::parse_reply(raw).unwrap();
        assert!(resp.tool_calls[0].arguments.is_empty());
    }

    #[test]
    fn test_request_shape() {
        let client = GeminiClient::new(reqwest::Client::new(), ProviderConfig::new(ProviderKind::Gemini, "g"));
        let history = vec![
            ConversationTurn::user_text("zoom in"),
            ConversationTurn::assistant(Some("ok".into()), Vec::new()),
        ];
        let body = client.build_request(&history, Some("Zm9v"));
        assert_eq!(body["generationConfig"]["temperature"], 0.7);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(body["tools"][0]["functionDeclarations"].as_array().unwrap().len(), 8);
        assert!(body["systemInstruction"]["parts"][0]["text"].is_string());

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(contents[2]["parts"][1]["inlineData"]["data"], "Zm9v");
    }

    #[test]
    fn test_frame_joins_trailing_user_turn() {
        let client = GeminiClient::new(reqwest::Client::new(), ProviderConfig::new(ProviderKind::Gemini, "g"));
        let body = client.build_request(&[ConversationTurn::user_text("zoom in")], Some("Zm9v"));
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 3);
    }
}
