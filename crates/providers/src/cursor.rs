//! Cursor adapter.
//!
//! Cursor has no public chat-completions API; requests are proxied through
//! Cursor's own backend using a logged-in account's bearer token. The
//! pipeline resolves which session to use (Quota Manager, §4.3) *before*
//! dispatch and carries it on [`ChatRequest::cursor_session_token`] — this
//! adapter never picks a session itself.

use crate::traits::{ChatRequest, ChatResponse, ProviderClient};
use crate::util::from_reqwest;
use sa_domain::capability::{ProviderCapabilities, ToolSupport};
use sa_domain::error::{Error, Result};
use sa_domain::stream::{BoxStream, StreamEvent, Usage};
use sa_domain::tool::{Message, MessageContent, Role};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://cursor.com";

/// Cookie name Cursor's backend expects on every authenticated request —
/// the probe (§4.2) and the chat-completion RPC (§4.4) both use it.
const SESSION_COOKIE_NAME: &str = "cursor_session";

pub struct CursorProvider {
    base_url: String,
    models: Vec<String>,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
    /// Flipped by the registry whenever the Session Pool reports at least
    /// one valid session; read by [`ProviderClient::is_available`].
    has_sessions: Arc<AtomicBool>,
}

impl CursorProvider {
    pub fn new(models: Vec<String>, has_sessions: Arc<AtomicBool>) -> Result<Self> {
        let capabilities = ProviderCapabilities {
            supports_tools: ToolSupport::None,
            supports_streaming: true,
            supports_vision: false,
            context_window_tokens: None,
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: DEFAULT_BASE_URL.into(),
            models,
            capabilities,
            client,
            has_sessions,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": role_to_str(m.role),
                    "content": m.content.extract_all_text(),
                })
            })
            .collect();
        serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": true,
        })
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn non_text_warning(messages: &[Message]) -> bool {
    messages
        .iter()
        .any(|m| matches!(m.content, MessageContent::Parts(_)))
}

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

    let choice = match v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    {
        Some(c) => c,
        None => return events,
    };

    if let Some(text) = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Content {
                delta: text.to_string(),
            }));
        }
    }

    if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        if let Some(usage) = v.get("usage").and_then(|u| {
            Some(Usage::new(
                u.get("prompt_tokens")?.as_u64()? as u32,
                u.get("completion_tokens")?.as_u64()? as u32,
            ))
        }) {
            events.push(Ok(StreamEvent::Usage { tokens: usage }));
        }
        events.push(Ok(StreamEvent::Done {
            finish_reason: Some(fr.to_string()),
        }));
    }

    events
}

#[async_trait::async_trait]
impl ProviderClient for CursorProvider {
    fn is_available(&self) -> bool {
        self.has_sessions.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        "cursor"
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
        let token = req.cursor_session_token.clone().ok_or_else(|| {
            Error::Provider {
                provider: "cursor".into(),
                message: "no Cursor session token attached to request".into(),
            }
        })?;
        if non_text_warning(&req.messages) {
            tracing::debug!("cursor adapter received non-text content parts; only text is sent");
        }

        let url = format!("{}/api/chat/completions", self.base_url);
        let body = self.build_body(&req);

        let resp = self
            .client
            .post(&url)
            .header("Cookie", format!("{SESSION_COOKIE_NAME}={token}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "cursor".into(),
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
    fn missing_token_is_surfaced_as_error() {
        let has_sessions = Arc::new(AtomicBool::new(true));
        let provider = CursorProvider::new(vec!["cursor-small".into()], has_sessions).unwrap();
        assert!(provider.is_available());
    }

    #[test]
    fn done_sentinel_maps_to_done() {
        let mut started = true;
        let events = parse_sse_data_vec("[DONE]", &mut started);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done { .. })));
    }
}
