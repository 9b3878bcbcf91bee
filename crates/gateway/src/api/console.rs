//! Chat console (§6): `POST /api/chat/conversations/{id}/messages`.
//!
//! Used by the operator UI, not by upstream-compatible clients, so it
//! gets a much smaller SSE schema than `/v1/messages` or
//! `/v1/chat/completions`: `{type: "delta"|"tokens"|"error"|"done", ...}`.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Extension, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use sa_domain::stream::StreamEvent;
use sa_domain::tool::Message;
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::ApiKeySecret;
use crate::pipeline::{PipelineRequest, StreamAccountGuard};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConsoleMessageRequest {
    pub model: String,
    pub message: String,
}

pub async fn post_message(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(ApiKeySecret(secret)): Extension<ApiKeySecret>,
    Path(_conversation_id): Path<String>,
    axum::Json(req): axum::Json<ConsoleMessageRequest>,
) -> Response {
    let pipeline_req = PipelineRequest {
        client_ip: addr.ip(),
        api_key_secret: secret,
        requested_model: req.model,
        messages: vec![Message::user(req.message)],
        tools: Vec::new(),
        temperature: None,
        max_tokens: None,
        json_mode: false,
        stream: true,
    };

    let mut outcome = match state.pipeline().run(pipeline_req).await {
        Ok(o) => o,
        Err(e) => {
            let body = json!({"type": "error", "error": format!("{e:?}")});
            return Sse::new(futures_util::stream::once(async move {
                Ok::<_, std::convert::Infallible>(Event::default().data(body.to_string()))
            }))
            .into_response();
        }
    };

    let guard = StreamAccountGuard::new(state.pipeline(), &outcome);
    let stream = async_stream::stream! {
        loop {
            match outcome.stream.next().await {
                Some(Ok(StreamEvent::Start)) => {}
                Some(Ok(StreamEvent::Content { delta })) => {
                    yield Ok(Event::default().data(json!({"type": "delta", "delta": delta}).to_string()));
                }
                Some(Ok(StreamEvent::Usage { tokens })) => {
                    guard.observe_tokens(tokens.total_tokens as u64);
                    yield Ok(Event::default().data(json!({"type": "tokens", "tokens": tokens.total_tokens}).to_string()));
                }
                Some(Ok(StreamEvent::Done { .. })) => {
                    yield Ok(Event::default().data(json!({"type": "done"}).to_string()));
                    guard.finish(200);
                    break;
                }
                Some(Ok(StreamEvent::Error { message })) => {
                    yield Ok(Event::default().data(json!({"type": "error", "error": message}).to_string()));
                    guard.finish(502);
                    break;
                }
                Some(Err(e)) => {
                    yield Ok(Event::default().data(json!({"type": "error", "error": e.to_string()}).to_string()));
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

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
