//! Google Gemini adapter.
//!
//! Implements the Gemini `generateContent` / `streamGenerateContent` APIs.
//! Auth is an API key passed as a query parameter (`key={api_key}`), so
//! every logged URL must be redacted before it reaches a trace event.

use crate::traits::{ChatRequest, ChatResponse, ProviderClient};
use crate::util::from_reqwest;
use sa_domain::capability::{ProviderCapabilities, ToolSupport};
use sa_domain::error::{Error, Result};
use sa_domain::stream::{BoxStream, StreamEvent, Usage};
use sa_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GoogleProvider {
    base_url: String,
    api_key: String,
    models: Vec<String>,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(api_key: String, models: Vec<String>) -> Result<Self> {
        let capabilities = ProviderCapabilities {
            supports_tools: ToolSupport::Basic,
            supports_streaming: true,
            supports_vision: true,
            context_window_tokens: Some(1_000_000),
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

    fn generate_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        )
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        )
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut contents: Vec<Value> = Vec::new();
        let mut system_instruction: Option<Value> = None;

        for msg in &req.messages {
            match msg.role {
                Role::System => {
                    let text = msg.content.extract_all_text();
                    system_instruction = Some(serde_json::json!({"parts": [{"text": text}]}));
                }
                Role::User => contents.push(user_to_gemini(msg)),
                Role::Assistant => contents.push(assistant_to_gemini(msg)),
                Role::Tool => contents.push(tool_result_to_gemini(msg)),
            }
        }

        let mut body = serde_json::json!({"contents": contents});
        if let Some(si) = system_instruction {
            body["systemInstruction"] = si;
        }
        if !req.tools.is_empty() {
            let function_declarations: Vec<Value> = req.tools.iter().map(tool_to_gemini).collect();
            body["tools"] = serde_json::json!([{"functionDeclarations": function_declarations}]);
        }

        let mut gen_config = serde_json::json!({});
        if let Some(temp) = req.temperature {
            gen_config["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            gen_config["maxOutputTokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            gen_config["responseMimeType"] = serde_json::json!("application/json");
        }
        if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = gen_config;
        }
        body
    }
}

// ── Message serialization ───────────────────────────────────────────

fn user_to_gemini(msg: &Message) -> Value {
    serde_json::json!({"role": "user", "parts": content_to_gemini_parts(&msg.content)})
}

fn assistant_to_gemini(msg: &Message) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match &msg.content {
        MessageContent::Text(t) => parts.push(serde_json::json!({"text": t})),
        MessageContent::Parts(ps) => {
            for p in ps {
                match p {
                    ContentPart::Text { text } => parts.push(serde_json::json!({"text": text})),
                    ContentPart::ToolUse { id: _, name, input } => {
                        parts.push(serde_json::json!({
                            "functionCall": {"name": name, "args": input},
                        }));
                    }
                    _ => {}
                }
            }
        }
    }
    serde_json::json!({"role": "model", "parts": parts})
}

fn tool_result_to_gemini(msg: &Message) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match &msg.content {
        MessageContent::Parts(ps) => {
            for p in ps {
                if let ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = p
                {
                    parts.push(serde_json::json!({
                        "functionResponse": {"name": tool_use_id, "response": {"content": content}},
                    }));
                }
            }
        }
        MessageContent::Text(t) => {
            parts.push(serde_json::json!({
                "functionResponse": {"name": "unknown", "response": {"content": t}},
            }));
        }
    }
    serde_json::json!({"role": "user", "parts": parts})
}

fn content_to_gemini_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(t) => vec![serde_json::json!({"text": t})],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(serde_json::json!({"text": text})),
                ContentPart::Image { url, media_type } => {
                    let mt = media_type.as_deref().unwrap_or("image/png");
                    Some(serde_json::json!({"inlineData": {"mimeType": mt, "data": url}}))
                }
                _ => None,
            })
            .collect(),
    }
}

fn tool_to_gemini(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn map_finish_reason(fr: &str) -> String {
    match fr {
        "STOP" => "stop".into(),
        "MAX_TOKENS" => "length".into(),
        other => other.to_lowercase(),
    }
}

fn function_call_to_tool_call(fc: &Value) -> ToolCall {
    ToolCall {
        call_id: format!("call_{}", uuid::Uuid::new_v4()),
        tool_name: fc.get("name").and_then(|v| v.as_str()).unwrap_or("").into(),
        arguments: fc.get("args").cloned().unwrap_or_default(),
    }
}

// ── Non-streaming response ──────────────────────────────────────────

fn parse_gemini_response(body: &Value, model: &str) -> Result<ChatResponse> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "google".into(),
            message: "no candidates in response".into(),
        })?;

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());

    let mut text_content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(parts) = parts {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                text_content.push_str(text);
            }
            if let Some(fc) = part.get("functionCall") {
                tool_calls.push(function_call_to_tool_call(fc));
            }
        }
    }

    let finish_reason = candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .map(map_finish_reason);
    let usage = body.get("usageMetadata").and_then(parse_gemini_usage);

    Ok(ChatResponse {
        content: text_content,
        tool_calls,
        usage,
        model: model.to_string(),
        finish_reason,
    })
}

fn parse_gemini_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("promptTokenCount")?.as_u64()? as u32;
    let completion = v.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

// ── Streaming ────────────────────────────────────────────────────────

fn parse_gemini_sse_data(data: &str, started: &mut bool) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    if !*started {
        *started = true;
        events.push(Ok(StreamEvent::Start));
    }

    let candidate = match v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    {
        Some(c) => c,
        None => return events,
    };

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(Ok(StreamEvent::Content {
                        delta: text.to_string(),
                    }));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let call = function_call_to_tool_call(fc);
                let rehydrated = serde_json::json!({
                    "id": call.call_id, "name": call.tool_name, "arguments": call.arguments,
                });
                events.push(Ok(StreamEvent::Content {
                    delta: format!("<tool_call>{rehydrated}</tool_call>"),
                }));
            }
        }
    }

    if let Some(fr) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        if let Some(usage) = v.get("usageMetadata").and_then(parse_gemini_usage) {
            events.push(Ok(StreamEvent::Usage { tokens: usage }));
        }
        events.push(Ok(StreamEvent::Done {
            finish_reason: Some(map_finish_reason(fr)),
        }));
    }

    events
}

/// Redact the `key=` query param before a Gemini URL reaches a log line.
fn redact_url_key(url: &str) -> String {
    if let Some(idx) = url.find("key=") {
        let prefix = &url[..idx + 4];
        let rest = &url[idx + 4..];
        let end = rest.find('&').unwrap_or(rest.len());
        format!("{prefix}[REDACTED]{}", &rest[end..])
    } else {
        url.to_string()
    }
}

#[async_trait::async_trait]
impl ProviderClient for GoogleProvider {
    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn name(&self) -> &str {
        "google"
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
        let model = req.model.clone();

        if !req.stream {
            let url = self.generate_url(&model);
            let body = self.build_body(&req);
            tracing::debug!(url = %redact_url_key(&url), "google chat request");

            let resp = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(from_reqwest)?;
            let status = resp.status();
            let text = resp.text().await.map_err(from_reqwest)?;
            if !status.is_success() {
                return Err(Error::Provider {
                    provider: "google".into(),
                    message: format!("HTTP {} - {text}", status.as_u16()),
                });
            }
            let parsed = parse_gemini_response(&serde_json::from_str(&text)?, &model)?;
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

        let url = self.stream_url(&model);
        let body = self.build_body(&req);
        tracing::debug!(url = %redact_url_key(&url), "google stream request");

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "google".into(),
                message: format!("HTTP {} - {text}", status.as_u16()),
            });
        }

        let mut started = false;
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_gemini_sse_data(data, &mut started)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_key_query_param() {
        let url = "https://host/v1beta/models/gemini-2.0-flash:generateContent?key=abc123&alt=sse";
        assert_eq!(
            redact_url_key(url),
            "https://host/v1beta/models/gemini-2.0-flash:generateContent?key=[REDACTED]&alt=sse"
        );
    }

    #[test]
    fn maps_known_finish_reasons() {
        assert_eq!(map_finish_reason("STOP"), "stop");
        assert_eq!(map_finish_reason("MAX_TOKENS"), "length");
        assert_eq!(map_finish_reason("SAFETY"), "safety");
    }
}
