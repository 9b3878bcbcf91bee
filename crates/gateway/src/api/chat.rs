//! OpenAI-compatible `POST /v1/chat/completions` (§6).
//!
//! Buffered and streaming paths share [`crate::pipeline::Pipeline`]; this
//! module only translates the OpenAI wire shape to and from the
//! gateway's internal [`sa_domain::tool::Message`] / [`StreamEvent`]
//! types.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Extension, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use sa_domain::stream::StreamEvent;
use sa_domain::tool::{Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::auth::ApiKeySecret;
use crate::api::error::{ApiError, ProviderErrorKind};
use crate::pipeline::{PipelineOutcome, PipelineRequest, StreamAccountGuard};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

fn to_internal_messages(wire: Vec<WireMessage>) -> Vec<Message> {
    wire.into_iter()
        .map(|m| {
            let role = match m.role.as_str() {
                "system" => Role::System,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => Role::User,
            };
            Message {
                role,
                content: sa_domain::tool::MessageContent::Text(m.content),
            }
        })
        .collect()
}

fn build_request(
    addr: SocketAddr,
    secret: String,
    req: ChatCompletionsRequest,
) -> PipelineRequest {
    PipelineRequest {
        client_ip: addr.ip(),
        api_key_secret: secret,
        requested_model: req.model,
        messages: to_internal_messages(req.messages),
        tools: Vec::new(),
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        json_mode: false,
        stream: req.stream,
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(ApiKeySecret(secret)): Extension<ApiKeySecret>,
    Json(req): Json<ChatCompletionsRequest>,
) -> Response {
    let stream = req.stream;
    let pipeline_req = build_request(addr, secret, req);

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

#[derive(Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<Choice>,
    usage: UsageBody,
}

#[derive(Serialize)]
struct Choice {
    index: u32,
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Serialize)]
struct ChoiceMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct UsageBody {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

async fn buffered_response(
    state: &AppState,
    mut outcome: PipelineOutcome,
) -> Result<ChatCompletionResponse, ApiError> {
    let guard = StreamAccountGuard::new(state.pipeline(), &outcome);
    let mut content = String::new();
    let mut finish_reason = None;
    let mut usage = sa_domain::stream::Usage::default();

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
            StreamEvent::Content { delta } => content.push_str(&delta),
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

    guard.finish(200);

    Ok(ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model: outcome.model,
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant",
                content,
            },
            finish_reason,
        }],
        usage: UsageBody {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        },
    })
}

fn streaming_response(
    state: AppState,
    mut outcome: PipelineOutcome,
) -> Sse<impl futures_core::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let model = outcome.model.clone();
    let guard = StreamAccountGuard::new(state.pipeline(), &outcome);

    let stream = async_stream::stream! {
        loop {
            match outcome.stream.next().await {
                Some(Ok(StreamEvent::Start)) => {}
                Some(Ok(StreamEvent::Content { delta })) => {
                    let chunk = json!({
                        "id": id,
                        "object": "chat.completion.chunk",
                        "model": model,
                        "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}],
                    });
                    yield Ok(Event::default().data(chunk.to_string()));
                }
                Some(Ok(StreamEvent::Usage { tokens })) => {
                    guard.observe_tokens(tokens.total_tokens as u64);
                }
                Some(Ok(StreamEvent::Done { finish_reason })) => {
                    let chunk = json!({
                        "id": id,
                        "object": "chat.completion.chunk",
                        "model": model,
                        "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason.unwrap_or_else(|| "stop".into())}],
                    });
                    yield Ok(Event::default().data(chunk.to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                    guard.finish(200);
                    break;
                }
                Some(Ok(StreamEvent::Error { message })) => {
                    let chunk = json!({"error": {"message": message, "type": "PROVIDER_ERROR"}});
                    yield Ok(Event::default().data(chunk.to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                    guard.finish(502);
                    break;
                }
                Some(Err(e)) => {
                    let chunk = json!({"error": {"message": e.to_string(), "type": "PROVIDER_ERROR"}});
                    yield Ok(Event::default().data(chunk.to_string()));
                    yield Ok(Event::default().data("[DONE]"));
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
