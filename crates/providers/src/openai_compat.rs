//! OpenAI-compatible adapter.
//!
//! Serves OpenAI itself, DeepSeek, and the OpenRouter free tier — all three
//! speak the same chat-completions wire format, differing only in
//! `base_url` and `model` namespace.

use crate::traits::{ChatRequest, ChatResponse, ProviderClient};
use crate::util::from_reqwest;
use sa_domain::capability::{ProviderCapabilities, ToolSupport};
use sa_domain::error::{Error, Result};
use sa_domain::stream::{BoxStream, StreamEvent, Usage};
use sa_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use serde_json::Value;

pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: String,
        models: Vec<String>,
    ) -> Result<Self> {
        let capabilities = ProviderCapabilities {
            supports_tools: ToolSupport::StrictJson,
            supports_streaming: true,
            supports_vision: true,
            context_window_tokens: Some(128_000),
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            models,
            capabilities,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ── Message serialization ───────────────────────────────────────────

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Parts(parts) => {
            for part in parts {
                if let ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = part
                {
                    return serde_json::json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    });
                }
            }
            serde_json::json!({"role": "tool", "tool_call_id": "", "content": ""})
        }
        MessageContent::Text(t) => {
            serde_json::json!({"role": "tool", "tool_call_id": "", "content": t})
        }
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ── Non-streaming response ──────────────────────────────────────────

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "openai_compat".into(),
            message: "no choices in response".into(),
        })?;
    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: "openai_compat".into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let tool_calls = parse_openai_tool_calls(message);
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model,
        finish_reason,
    })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value = serde_json::from_str(args_str).unwrap_or_default();
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage::new(
        v.get("prompt_tokens")?.as_u64()? as u32,
        v.get("completion_tokens")?.as_u64()? as u32,
    ))
}

// ── Streaming ────────────────────────────────────────────────────────

fn parse_sse_data_vec(data: &str, started: &mut bool) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(StreamEvent::Done {
            finish_reason: Some("stop".into()),
        })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let mut events = Vec::new();
    if !*started {
        *started = true;
        events.push(Ok(StreamEvent::Start));
    }

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    let choice = match choice {
        Some(c) => c,
        None => {
            if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
                events.push(Ok(StreamEvent::Usage { tokens: usage }));
            }
            return events;
        }
    };

    let delta = choice.get("delta").unwrap_or(&Value::Null);
    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Content {
                delta: text.to_string(),
            }));
        }
    }

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
            events.push(Ok(StreamEvent::Usage { tokens: usage }));
        }
        events.push(Ok(StreamEvent::Done {
            finish_reason: Some(fr.to_string()),
        }));
    }

    events
}

#[async_trait::async_trait]
impl ProviderClient for OpenAiCompatProvider {
    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn name(&self) -> &str {
        &self.name
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
        let url = format!("{}/chat/completions", self.base_url);

        if !req.stream {
            let body = self.build_chat_body(&req, false);
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
                    provider: self.name.clone(),
                    message: format!("HTTP {} - {text}", status.as_u16()),
                });
            }
            let parsed = parse_chat_response(&serde_json::from_str(&text)?)?;
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

        let body = self.build_chat_body(&req, true);
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
                provider: self.name.clone(),
                message: format!("HTTP {} - {text}", status.as_u16()),
            });
        }

        let mut started = false;
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_sse_data_vec(data, &mut started)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_sentinel_maps_to_done_event() {
        let mut started = true;
        let events = parse_sse_data_vec("[DONE]", &mut started);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done { .. })));
    }

    #[test]
    fn first_chunk_emits_start_then_content() {
        let mut started = false;
        let events = parse_sse_data_vec(
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#,
            &mut started,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(StreamEvent::Start)));
        assert!(matches!(events[1], Ok(StreamEvent::Content { .. })));
        assert!(started);
    }

    #[test]
    fn finish_reason_emits_usage_then_done() {
        let mut started = true;
        let events = parse_sse_data_vec(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#,
            &mut started,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(StreamEvent::Usage { .. })));
        assert!(matches!(events[1], Ok(StreamEvent::Done { .. })));
    }
}
