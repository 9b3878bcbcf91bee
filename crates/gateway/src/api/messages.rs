//! Anthropic-compatible `POST /v1/messages` (§6).
//!
//! Inbound translation mirrors `sa_providers::anthropic`'s request
//! builder (system messages collapse onto one top-level field). Outbound
//! translation is this module's own responsibility: it re-expands the
//! gateway's normalised [`StreamEvent`] stream back into the Anthropic
//! six-event choreography (`message_start` / `content_block_start` /
//! `content_block_delta` / `content_block_stop` / `message_delta` /
//! `message_stop`), decoding the `<tool_call>{...}</tool_call>` sentinel
//! the ingest-side adapter rehydrates tool_use blocks into back into a
//! proper `tool_use` content block.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Extension, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use sa_domain::stream::{StreamEvent, Usage};
use sa_domain::tool::{Message, MessageContent, Role};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::auth::ApiKeySecret;
use crate::api::error::{ApiError, ProviderErrorKind};
use crate::pipeline::{PipelineOutcome, PipelineRequest, StreamAccountGuard};
use crate::state::AppState;

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<Value>,
    pub messages: Vec<WireMessage>,
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: Value,
}

fn system_text(system: &Option<Value>) -> Option<String> {
    match system {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => {
            let joined: Vec<String> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .map(str::to_string)
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    }
}

fn wire_content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn to_internal_messages(req: &MessagesRequest) -> Vec<Message> {
    let mut messages = Vec::new();
    // S5: consecutive system entries join with "\n" onto one leading
    // system message, matching the Anthropic adapter's own collapse.
    if let Some(system) = system_text(&req.system) {
        messages.push(Message::system(system));
    }
    for m in &req.messages {
        let text = wire_content_to_text(&m.content);
        match m.role.as_str() {
            "assistant" => messages.push(Message::assistant(text)),
            _ => messages.push(Message {
                role: Role::User,
                content: MessageContent::Text(text),
            }),
        }
    }
    messages
}

pub async fn messages(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(ApiKeySecret(secret)): Extension<ApiKeySecret>,
    Json(req): Json<MessagesRequest>,
) -> Response {
    let stream = req.stream;
    let model = req.model.clone();
    let max_tokens = req.max_tokens;
    let temperature = req.temperature;
    let internal_messages = to_internal_messages(&req);

    let pipeline_req = PipelineRequest {
        client_ip: addr.ip(),
        api_key_secret: secret,
        requested_model: model,
        messages: internal_messages,
        tools: Vec::new(),
        temperature,
        max_tokens: Some(max_tokens),
        json_mode: false,
        stream,
    };

    let outcome = match state.pipeline().run(pipeline_req).await {
        Ok(o) => o,
        Err(e) => return e.into_response(),
    };

    if stream {
        streaming_response(state, outcome).into_response()
    } else {
        match buffered_response(&state, outcome).await {
            Ok(body) => Json(body).into_response(),
            Err(e) => e.into_response(),
        }
    }
}

/// Decodes `<tool_call>{...}</tool_call>` sentinels embedded in a
/// normalised content stream back into structured blocks; the inverse of
/// `sa_providers::anthropic::StreamState::push_text`.
struct SentinelDecoder {
    held: String,
}

enum Decoded {
    Text(String),
    ToolCall { id: String, name: String, arguments: Value },
}

impl SentinelDecoder {
    fn new() -> Self {
        Self { held: String::new() }
    }

    /// Feed more normalised content and drain every block that can be
    /// confidently decoded. Bare text is held back only while it's a
    /// strict prefix of the open sentinel.
    fn push(&mut self, delta: &str) -> Vec<Decoded> {
        self.held.push_str(delta);
        let mut out = Vec::new();
        loop {
            if let Some(start) = self.held.find(TOOL_CALL_OPEN) {
                if start > 0 {
                    out.push(Decoded::Text(self.held[..start].to_string()));
                }
                if let Some(end) = self.held.find(TOOL_CALL_CLOSE) {
                    let json_str =
                        &self.held[start + TOOL_CALL_OPEN.len()..end];
                    if let Ok(v) = serde_json::from_str::<Value>(json_str) {
                        out.push(Decoded::ToolCall {
                            id: v.get("id").and_then(|x| x.as_str()).unwrap_or("").to_string(),
                            name: v.get("name").and_then(|x| x.as_str()).unwrap_or("").to_string(),
                            arguments: v.get("arguments").cloned().unwrap_or(Value::Null),
                        });
                    }
                    self.held = self.held[end + TOOL_CALL_CLOSE.len()..].to_string();
                    continue;
                } else {
                    // Sentinel opened but not yet closed; hold everything
                    // from the opening tag onward.
                    self.held = self.held[start..].to_string();
                    return out;
                }
            }
            // No full open tag present. Check whether the tail is a
            // prefix of the opening tag and must be held back.
            let max_check = self.held.len().min(TOOL_CALL_OPEN.len());
            let ambiguous_at = (1..=max_check)
                .rev()
                .find(|&n| TOOL_CALL_OPEN.starts_with(&self.held[self.held.len() - n..]));
            match ambiguous_at {
                Some(n) if n == self.held.len() => return out,
                Some(n) => {
                    let split = self.held.len() - n;
                    if split > 0 {
                        out.push(Decoded::Text(self.held[..split].to_string()));
                    }
                    self.held = self.held[split..].to_string();
                    return out;
                }
                None => {
                    if !self.held.is_empty() {
                        out.push(Decoded::Text(std::mem::take(&mut self.held)));
                    }
                    return out;
                }
            }
        }
    }

    fn flush(&mut self) -> Option<Decoded> {
        if self.held.is_empty() {
            None
        } else {
            Some(Decoded::Text(std::mem::take(&mut self.held)))
        }
    }
}

#[derive(Serialize)]
struct MessagesResponse {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    role: &'static str,
    model: String,
    content: Vec<Value>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Serialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

async fn buffered_response(
    state: &AppState,
    mut outcome: PipelineOutcome,
) -> Result<MessagesResponse, ApiError> {
    let guard = StreamAccountGuard::new(state.pipeline(), &outcome);
    let mut decoder = SentinelDecoder::new();
    let mut content = Vec::new();
    let mut finish_reason = None;
    let mut usage = Usage::default();

    loop {
        let event = match outcome.stream.next().await {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                guard.finish(502);
                return Err(ApiError::ProviderError {
                    kind: ProviderErrorKind::ProviderError,
                    message: e.to_string(),
                });
            }
            None => break,
        };
        match event {
            StreamEvent::Start => {}
            StreamEvent::Content { delta } => {
                for block in decoder.push(&delta) {
                    content.push(decoded_to_json(block));
                }
            }
            StreamEvent::Usage { tokens } => {
                usage = tokens;
                guard.observe_tokens(usage.total_tokens as u64);
            }
            StreamEvent::Done { finish_reason: reason } => {
                finish_reason = reason;
                break;
            }
            StreamEvent::Error { message } => {
                guard.finish(502);
                return Err(ApiError::ProviderError {
                    kind: ProviderErrorKind::ProviderError,
                    message,
                });
            }
        }
    }
    if let Some(block) = decoder.flush() {
        content.push(decoded_to_json(block));
    }

    guard.finish(200);

    Ok(MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4()),
        kind: "message",
        role: "assistant",
        model: outcome.model,
        content,
        stop_reason: finish_reason,
        usage: AnthropicUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    })
}

fn decoded_to_json(block: Decoded) -> Value {
    match block {
        Decoded::Text(text) => json!({"type": "text", "text": text}),
        Decoded::ToolCall { id, name, arguments } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": arguments})
        }
    }
}

fn streaming_response(
    state: AppState,
    mut outcome: PipelineOutcome,
) -> Sse<impl futures_core::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let id = format!("msg_{}", uuid::Uuid::new_v4());
    let model = outcome.model.clone();
    let guard = StreamAccountGuard::new(state.pipeline(), &outcome);

    let stream = async_stream::stream! {
        let mut decoder = SentinelDecoder::new();
        let mut block_index: u64 = 0;
        let mut block_open = false;
        let mut prompt_tokens = 0u32;
        let mut total_tokens: u64 = 0;

        yield Ok(anthropic_event("message_start", json!({
            "type": "message_start",
            "message": {"id": id, "type": "message", "role": "assistant", "model": model,
                        "content": [], "usage": {"input_tokens": 0, "output_tokens": 0}},
        })));

        loop {
            match outcome.stream.next().await {
                Some(Ok(StreamEvent::Start)) => {}
                Some(Ok(StreamEvent::Content { delta })) => {
                    for block in decoder.push(&delta) {
                        for ev in emit_block(&mut block_index, &mut block_open, block) {
                            yield Ok(ev);
                        }
                    }
                }
                Some(Ok(StreamEvent::Usage { tokens })) => {
                    prompt_tokens = tokens.prompt_tokens;
                    total_tokens = tokens.total_tokens as u64;
                    guard.observe_tokens(total_tokens);
                }
                Some(Ok(StreamEvent::Done { finish_reason })) => {
                    if let Some(block) = decoder.flush() {
                        for ev in emit_block(&mut block_index, &mut block_open, block) {
                            yield Ok(ev);
                        }
                    }
                    if block_open {
                        yield Ok(anthropic_event("content_block_stop", json!({
                            "type": "content_block_stop", "index": block_index,
                        })));
                    }
                    yield Ok(anthropic_event("message_delta", json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": finish_reason.unwrap_or_else(|| "end_turn".into())},
                        "usage": {"input_tokens": prompt_tokens, "output_tokens": total_tokens},
                    })));
                    yield Ok(anthropic_event("message_stop", json!({"type": "message_stop"})));
                    guard.finish(200);
                    break;
                }
                Some(Ok(StreamEvent::Error { message })) => {
                    yield Ok(anthropic_event("error", json!({
                        "type": "error", "error": {"type": "PROVIDER_ERROR", "message": message},
                    })));
                    guard.finish(502);
                    break;
                }
                Some(Err(e)) => {
                    yield Ok(anthropic_event("error", json!({
                        "type": "error", "error": {"type": "PROVIDER_ERROR", "message": e.to_string()},
                    })));
                    guard.finish(502);
                    break;
                }
                None => {
                    guard.finish(200);
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn emit_block(index: &mut u64, open: &mut bool, block: Decoded) -> Vec<Event> {
    let mut events = Vec::new();
    match block {
        Decoded::Text(text) => {
            if !*open {
                events.push(anthropic_event("content_block_start", json!({
                    "type": "content_block_start", "index": *index,
                    "content_block": {"type": "text", "text": ""},
                })));
                *open = true;
            }
            events.push(anthropic_event("content_block_delta", json!({
                "type": "content_block_delta", "index": *index,
                "delta": {"type": "text_delta", "text": text},
            })));
        }
        Decoded::ToolCall { id, name, arguments } => {
            if *open {
                events.push(anthropic_event("content_block_stop", json!({
                    "type": "content_block_stop", "index": *index,
                })));
                *open = false;
                *index += 1;
            }
            events.push(anthropic_event("content_block_start", json!({
                "type": "content_block_start", "index": *index,
                "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
            })));
            events.push(anthropic_event("content_block_delta", json!({
                "type": "content_block_delta", "index": *index,
                "delta": {"type": "input_json_delta", "partial_json": arguments.to_string()},
            })));
            events.push(anthropic_event("content_block_stop", json!({
                "type": "content_block_stop", "index": *index,
            })));
            *index += 1;
        }
    }
    events
}

fn anthropic_event(event_type: &str, body: Value) -> Event {
    Event::default().event(event_type).data(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_array_joins_text_parts() {
        let system = Some(json!([{"type": "text", "text": "A"}, {"type": "text", "text": "B"}]));
        assert_eq!(system_text(&system).unwrap(), "A\nB");
    }

    #[test]
    fn decoder_passes_through_plain_text() {
        let mut decoder = SentinelDecoder::new();
        let out = decoder.push("hello world");
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Decoded::Text(t) if t == "hello world"));
    }

    #[test]
    fn decoder_holds_back_ambiguous_tail() {
        let mut decoder = SentinelDecoder::new();
        let out = decoder.push("hi <tool_");
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Decoded::Text(t) if t == "hi "));
        assert_eq!(decoder.held, "<tool_");
    }

    #[test]
    fn decoder_decodes_complete_sentinel() {
        let mut decoder = SentinelDecoder::new();
        let payload = r#"<tool_call>{"id":"1","name":"search","arguments":{"q":"rust"}}</tool_call>"#;
        let out = decoder.push(payload);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Decoded::ToolCall { id, name, .. } => {
                assert_eq!(id, "1");
                assert_eq!(name, "search");
            }
            _ => panic!("expected a tool call"),
        }
    }

    #[test]
    fn decoder_splits_text_before_and_after_sentinel() {
        let mut decoder = SentinelDecoder::new();
        let payload = r#"before <tool_call>{"id":"1","name":"x","arguments":{}}</tool_call> after"#;
        let out = decoder.push(payload);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Decoded::Text(t) if t == "before "));
        assert!(matches!(&out[1], Decoded::ToolCall { .. }));
        assert!(matches!(&out[2], Decoded::Text(t) if t == " after"));
    }
}
