//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API: the system-message-as-top-level-
//! field quirk, tool use, vision content parts, and the 6-event SSE
//! choreography (`message_start` / `content_block_start` /
//! `content_block_delta` / `content_block_stop` / `message_delta` /
//! `message_stop`) collapsed onto the gateway's five normalised
//! [`StreamEvent`] variants.

use crate::traits::{ChatRequest, ChatResponse, ProviderClient};
use crate::util::from_reqwest;
use sa_domain::capability::{ProviderCapabilities, ToolSupport};
use sa_domain::error::{Error, Result};
use sa_domain::stream::{BoxStream, StreamEvent, Usage};
use sa_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Tool-call content blocks have no equivalent in the normalised
/// `StreamEvent` union, so they are rehydrated into the content stream as
/// a `<tool_call name="..">{json}</tool_call>` sentinel. A literal
/// occurrence of that prefix inside ordinary assistant text would be
/// ambiguous to a downstream parser, so emission is held back while the
/// tail of what's buffered could still grow into the sentinel.
const TOOL_CALL_SENTINEL_PREFIX: &str = "<tool_call";

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    models: Vec<String>,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, models: Vec<String>) -> Result<Self> {
        let capabilities = ProviderCapabilities {
            supports_tools: ToolSupport::StrictJson,
            supports_streaming: true,
            supports_vision: true,
            context_window_tokens: Some(200_000),
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key,
            models,
            capabilities,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.extract_all_text()),
                Role::User => api_messages.push(user_msg_to_anthropic(msg)),
                Role::Assistant => api_messages.push(assistant_msg_to_anthropic(msg)),
                Role::Tool => api_messages.push(tool_result_to_anthropic(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": api_messages,
            "stream": stream,
        });

        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body["max_tokens"] = serde_json::json!(req.max_tokens.unwrap_or(4096));
        body
    }
}

// ── Message serialization ───────────────────────────────────────────

fn user_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({"role": "user", "content": t}),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => {
                        Some(serde_json::json!({"type": "text", "text": text}))
                    }
                    ContentPart::Image { url, media_type } => {
                        let mt = media_type.as_deref().unwrap_or("image/png");
                        Some(serde_json::json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": mt, "data": url},
                        }))
                    }
                    _ => None,
                })
                .collect();
            serde_json::json!({"role": "user", "content": content})
        }
    }
}

fn assistant_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => {
            serde_json::json!({"role": "assistant", "content": [{"type": "text", "text": t}]})
        }
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => {
                        Some(serde_json::json!({"type": "text", "text": text}))
                    }
                    ContentPart::ToolUse { id, name, input } => Some(serde_json::json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    })),
                    _ => None,
                })
                .collect();
            serde_json::json!({"role": "assistant", "content": content})
        }
    }
}

fn tool_result_to_anthropic(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![
            serde_json::json!({"type": "tool_result", "tool_use_id": "", "content": t}),
        ],
    };
    serde_json::json!({"role": "user", "content": content})
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

// ── Non-streaming response ──────────────────────────────────────────

fn parse_anthropic_response(body: &Value) -> Result<ChatResponse> {
    let content_arr = body
        .get("content")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in &content_arr {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                tool_calls.push(ToolCall {
                    call_id: block.get("id").and_then(|v| v.as_str()).unwrap_or("").into(),
                    tool_name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").into(),
                    arguments: block.get("input").cloned().unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let finish_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(map_stop_reason);
    let usage = body.get("usage").and_then(parse_anthropic_usage);

    Ok(ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        usage,
        model,
        finish_reason,
    })
}

fn parse_anthropic_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage::new(input, output))
}

fn map_stop_reason(s: &str) -> String {
    match s {
        "end_turn" => "stop".into(),
        "tool_use" => "tool_calls".into(),
        other => other.into(),
    }
}

// ── Streaming ────────────────────────────────────────────────────────

struct StreamState {
    active_tool_calls: std::collections::HashMap<u64, (String, String, String)>,
    prompt_tokens: u32,
    held: String,
    done_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active_tool_calls: std::collections::HashMap::new(),
            prompt_tokens: 0,
            held: String::new(),
            done_emitted: false,
        }
    }

    /// Emit `delta` as a `Content` event, holding back any suffix that is a
    /// prefix of [`TOOL_CALL_SENTINEL_PREFIX`] until it's disambiguated.
    fn push_text(&mut self, delta: &str, out: &mut Vec<Result<StreamEvent>>) {
        self.held.push_str(delta);
        loop {
            if self.held.starts_with(TOOL_CALL_SENTINEL_PREFIX) {
                // Genuinely looks like our sentinel; hold it all back.
                return;
            }
            let longest_ambiguous = (1..=self.held.len().min(TOOL_CALL_SENTINEL_PREFIX.len()))
                .rev()
                .find(|&n| TOOL_CALL_SENTINEL_PREFIX.starts_with(&self.held[..n]));
            match longest_ambiguous {
                Some(n) if n == self.held.len() => return,
                Some(n) => {
                    // held[..n] is still a viable sentinel prefix; keep it
                    // back and flush everything after the divergence point.
                    let (ambiguous, safe) = self.held.split_at(n);
                    let safe = safe.to_string();
                    let ambiguous = ambiguous.to_string();
                    if !safe.is_empty() {
                        out.push(Ok(StreamEvent::Content { delta: safe }));
                    }
                    self.held = ambiguous;
                    return;
                }
                None => {
                    out.push(Ok(StreamEvent::Content {
                        delta: std::mem::take(&mut self.held),
                    }));
                    return;
                }
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<Result<StreamEvent>>) {
        if !self.held.is_empty() {
            out.push(Ok(StreamEvent::Content {
                delta: std::mem::take(&mut self.held),
            }));
        }
    }
}

fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    match v.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "message_start" => {
            events.push(Ok(StreamEvent::Start));
            if let Some(tokens) = v
                .get("message")
                .and_then(|m| m.get("usage"))
                .and_then(|u| u.get("input_tokens"))
                .and_then(|t| t.as_u64())
            {
                state.prompt_tokens = tokens as u32;
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    state
                        .active_tool_calls
                        .insert(idx, (call_id, name, String::new()));
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                state.push_text(text, &mut events);
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                                tc.2.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some((call_id, tool_name, args_str)) = state.active_tool_calls.remove(&idx) {
                let arguments: Value = serde_json::from_str(&args_str).unwrap_or_default();
                let rehydrated = serde_json::json!({
                    "id": call_id, "name": tool_name, "arguments": arguments,
                });
                events.push(Ok(StreamEvent::Content {
                    delta: format!("<tool_call>{rehydrated}</tool_call>"),
                }));
            }
        }

        "message_delta" => {
            if let Some(output) = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|v| v.as_u64())
            {
                events.push(Ok(StreamEvent::Usage {
                    tokens: Usage::new(state.prompt_tokens, output as u32),
                }));
            }
            if let Some(reason) = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
            {
                state.flush(&mut events);
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    finish_reason: Some(map_stop_reason(reason)),
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.flush(&mut events);
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    finish_reason: Some("stop".into()),
                }));
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            events.push(Ok(StreamEvent::Error {
                message: msg.to_string(),
            }));
        }

        _ => {}
    }

    events
}

#[async_trait::async_trait]
impl ProviderClient for AnthropicProvider {
    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    fn supported_models(&self) -> &[String] {
        &self.models
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn chat_completion(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);

        if !req.stream {
            let body = self.build_messages_body(&req, false);
            let resp = self
                .authed_post(&url)
                .json(&body)
                .send()
                .await
                .map_err(from_reqwest)?;
            let status = resp.status();
            let text = resp.text().await.map_err(from_reqwest)?;
            if !status.is_success() {
                return Err(Error::Provider {
                    provider: "anthropic".into(),
                    message: format!("HTTP {} - {text}", status.as_u16()),
                });
            }
            let parsed = parse_anthropic_response(&serde_json::from_str(&text)?)?;
            let events = vec![
                Ok(StreamEvent::Start),
                Ok(StreamEvent::Content {
                    delta: parsed.content,
                }),
                Ok(StreamEvent::Usage {
                    tokens: parsed.usage.unwrap_or_default(),
                }),
                Ok(StreamEvent::Done {
                    finish_reason: parsed.finish_reason,
                }),
            ];
            return Ok(Box::pin(futures_util::stream::iter(events)));
        }

        let body = self.build_messages_body(&req, true);
        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "anthropic".into(),
                message: format!("HTTP {} - {text}", status.as_u16()),
            });
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_anthropic_sse(data, &mut state)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_text_holds_sentinel_prefix() {
        let mut state = StreamState::new();
        let mut out = Vec::new();
        state.push_text("<tool_", &mut out);
        assert!(out.is_empty());
        assert_eq!(state.held, "<tool_");
    }

    #[test]
    fn push_text_flushes_non_ambiguous_text() {
        let mut state = StreamState::new();
        let mut out = Vec::new();
        state.push_text("hello world", &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn push_text_flushes_after_divergence() {
        let mut state = StreamState::new();
        let mut out = Vec::new();
        state.push_text("<too", &mut out);
        assert!(out.is_empty());
        state.push_text("th fairy", &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn map_stop_reason_translates_known_values() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("tool_use"), "tool_calls");
        assert_eq!(map_stop_reason("max_tokens"), "max_tokens");
    }
}
