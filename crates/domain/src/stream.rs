use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Normalised streaming event emitted by every provider, independent of the
/// upstream wire dialect.
///
/// Every provider must emit [`StreamEvent::Start`] first and exactly one of
/// [`StreamEvent::Done`] / [`StreamEvent::Error`] last. `Content` fragments
/// are monotonically appended — concatenating every `delta` yields the final
/// model output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "start")]
    Start,

    #[serde(rename = "content")]
    Content { delta: String },

    #[serde(rename = "usage")]
    Usage { tokens: Usage },

    #[serde(rename = "done")]
    Done { finish_reason: Option<String> },

    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}
