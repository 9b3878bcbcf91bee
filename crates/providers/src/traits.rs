use sa_domain::capability::ProviderCapabilities;
use sa_domain::error::Result;
use sa_domain::stream::Usage;
use sa_domain::stream::{BoxStream, StreamEvent};
use sa_domain::tool::{Message, ToolCall, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request, already normalised by the
/// pipeline (model id resolved, key-level allowlist checked).
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub model: String,
    pub stream: bool,
    /// Set only when the resolved provider is Cursor; carries the bearer
    /// token the Quota Manager selected for this request.
    pub cursor_session_token: Option<String>,
}

/// A provider-agnostic chat completion response, used for the buffered
/// (non-streaming) path.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capability set every upstream adapter implements: availability,
/// identity, supported models, and a normalised chat-completion stream.
///
/// Implementations translate between the gateway's internal types and
/// the wire dialect of one upstream (OpenAI-compatible, Anthropic,
/// Google Gemini, or the internal Cursor RPC).
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    /// `true` when this adapter has the credentials it needs to serve a
    /// request right now (a configured API key, or at least one valid
    /// Cursor session in the pool).
    fn is_available(&self) -> bool;

    /// Stable provider identifier used in routing tables and trace events
    /// (`"openai"`, `"anthropic"`, `"google"`, `"deepseek"`, `"cursor"`).
    fn name(&self) -> &str;

    /// Canonical model ids this adapter will accept.
    fn supported_models(&self) -> &[String];

    fn capabilities(&self) -> &ProviderCapabilities;

    /// Stream a chat completion as normalised [`StreamEvent`]s. The first
    /// item is always `Start`; the last is always `Done` or `Error`.
    /// Dropping the returned stream aborts the upstream call.
    async fn chat_completion(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
