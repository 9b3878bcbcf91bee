//! The eight-stage request pipeline (§4.5): rate limit, authenticate,
//! normalise the model, resolve a provider, pick a Cursor session if one
//! is needed, dispatch, stream-adapt, and finally account.
//!
//! Callers on the HTTP edge (`api::chat`, `api::messages`, `api::console`)
//! build a [`PipelineRequest`] from their own wire format and drive this
//! module; this is where OpenAI-, Anthropic-, and console-shaped callers
//! converge onto one code path.

use std::net::IpAddr;

use sa_domain::tool::{Message, ToolDefinition};
use sa_providers::registry::ProviderRegistry;
use sa_providers::router;
use sa_providers::traits::{ChatRequest, ProviderClient};
use sa_domain::stream::{BoxStream, StreamEvent};

use crate::api::error::{ApiError, ProviderErrorKind};
use crate::key_manager::{KeyManager, RequestCheck};
use crate::quota::{QuotaManager, SelectError};
use crate::rate_limit::RateLimiter;
use crate::usage_tracker::UsageTracker;

/// A request that has already been translated from whatever wire format
/// the caller speaks into the gateway's internal shape.
pub struct PipelineRequest {
    pub client_ip: IpAddr,
    pub api_key_secret: String,
    pub requested_model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub stream: bool,
}

/// What stage 6+ produced: a normalised stream the caller adapts to its
/// own wire format, plus the bookkeeping stage 8 needs once the stream is
/// fully drained.
pub struct PipelineOutcome {
    pub model: String,
    pub provider_name: String,
    pub api_key_secret: String,
    /// The Cursor session selected in stage 5, if the resolved provider was
    /// `cursor` — `account()` needs this to call `QuotaManager::track_usage`.
    pub session_email: Option<String>,
    pub stream: BoxStream<'static, sa_domain::error::Result<StreamEvent>>,
}

#[derive(Clone)]
pub struct Pipeline {
    pub rate_limiter: std::sync::Arc<RateLimiter>,
    pub keys: std::sync::Arc<KeyManager>,
    pub quota: std::sync::Arc<QuotaManager>,
    pub providers: std::sync::Arc<ProviderRegistry>,
    pub usage: std::sync::Arc<UsageTracker>,
}

impl Pipeline {
    /// Stages 1-6: rate limit, authenticate, normalise, route, select a
    /// Cursor session if needed, and dispatch to the provider. Returns the
    /// raw provider stream; the caller is responsible for stage 7
    /// (adapting it to its own wire format) and for calling
    /// [`Pipeline::account`] (stage 8) once the stream completes.
    pub async fn run(&self, req: PipelineRequest) -> Result<PipelineOutcome, ApiError> {
        // Stage 1: rate limit.
        if !self.rate_limiter.check(req.client_ip) {
            return Err(ApiError::RateLimited);
        }

        // Stage 2: authenticate.
        use sa_domain::key::KeyActiveCheck;
        match self.keys.validate(&req.api_key_secret).await {
            KeyActiveCheck::NotFound => return Err(ApiError::InvalidApiKey),
            KeyActiveCheck::Inactive => return Err(ApiError::InvalidApiKey),
            KeyActiveCheck::Active => {}
        }

        // Stage 3: normalise the model id. An id with no alias-table entry
        // is rejected with 400, not forwarded upstream.
        let canonical_model = router::normalize_model(&req.requested_model)
            .map_err(|_| ApiError::UnknownModel(req.requested_model.clone()))?;

        // `ValidateForRequest`: balance, spend quota, expiry, model
        // allowlist, in that fixed order, against the canonical model.
        match self
            .keys
            .validate_for_request(&req.api_key_secret, &canonical_model)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
        {
            RequestCheck::Ok => {}
            RequestCheck::BalanceExhausted => return Err(ApiError::BalanceExhausted),
            RequestCheck::SpendQuotaExceeded => return Err(ApiError::TokenQuotaExceeded),
            RequestCheck::Expired => return Err(ApiError::TokenExpired),
            RequestCheck::ModelNotAllowed => return Err(ApiError::ModelNotAllowed),
        }

        // Stage 4: resolve a provider.
        let provider_name = router::route_provider(&canonical_model)
            .map_err(|e| ApiError::ProviderError {
                kind: ProviderErrorKind::ProviderError,
                message: e.to_string(),
            })?;
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| ApiError::ProviderNotAvailable(format!("{provider_name} not configured")))?;
        if !provider.is_available() {
            return Err(ApiError::ProviderNotAvailable(format!(
                "{provider_name} has no usable credentials"
            )));
        }

        // Stage 5: Cursor session selection, only when that's the resolved
        // provider.
        let (cursor_session_token, session_email) = if provider_name == "cursor" {
            let estimated = self.quota.estimate_request_tokens(&req.messages);
            let session = self
                .quota
                .select_session_for_request(estimated)
                .await
                .map_err(|e| match e {
                    SelectError::AllExhausted => {
                        ApiError::ProviderNotAvailable("all cursor sessions exhausted".into())
                    }
                })?;
            (Some(session.bearer_token), Some(session.email))
        } else {
            (None, None)
        };

        // Stage 6: dispatch.
        let chat_request = ChatRequest {
            messages: req.messages,
            tools: req.tools,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            json_mode: req.json_mode,
            model: canonical_model.clone(),
            stream: req.stream,
            cursor_session_token,
        };
        let stream = provider
            .chat_completion(chat_request)
            .await
            .map_err(|e| ApiError::ProviderError {
                kind: ProviderErrorKind::ProviderError,
                message: e.to_string(),
            })?;

        Ok(PipelineOutcome {
            model: canonical_model,
            provider_name: provider_name.to_string(),
            api_key_secret: req.api_key_secret,
            session_email,
            stream,
        })
    }

    /// Stage 8: accounting. Called by the caller once a stream has
    /// finished, failed, or been cancelled, with however many tokens it
    /// actually consumed. Both updates are fire-and-forget from the
    /// caller's perspective — the Key Manager bumps its counters
    /// synchronously in memory and the Quota Manager's session update does
    /// the same, both writing through on detached tasks. Takes the fields
    /// it needs rather than `&PipelineOutcome` so a drop guard watching
    /// for client disconnect (`upstream_status = 499`) can call it without
    /// holding the outcome's in-flight stream.
    pub fn account(
        &self,
        api_key_secret: &str,
        model: &str,
        session_email: Option<&str>,
        upstream_status: u16,
        total_tokens: u64,
    ) {
        self.keys.increment_usage(api_key_secret);
        if let Some(email) = session_email {
            self.quota.track_usage(email, total_tokens);
        }
        let mut record = sa_domain::usage::UsageRecord::new(api_key_secret, model, upstream_status);
        record.total_tokens = total_tokens as u32;
        record.completion_tokens = total_tokens as u32;
        self.usage.enqueue(record);
    }
}

/// Arms stage-8 accounting for a streaming response (§5: a client
/// disconnect cancels the context and still gets a usage record, with
/// `upstream_status = 499`).
///
/// `async_stream::stream!` generators only run their tail code if the
/// consumer polls the stream to exhaustion; axum drops an `Sse` response's
/// future outright on disconnect, skipping straight past any `account()`
/// call sitting after the yield loop. Build one of these at the top of the
/// stream, call [`StreamAccountGuard::observe_tokens`] as usage events
/// arrive, and call [`StreamAccountGuard::finish`] on every normal exit
/// path (`Done`, `Error`, or the stream ending). If the guard is dropped
/// without `finish` having run, `Drop` does the accounting itself with
/// `upstream_status = 499`.
pub struct StreamAccountGuard {
    pipeline: Pipeline,
    api_key_secret: String,
    model: String,
    session_email: Option<String>,
    total_tokens: std::cell::Cell<u64>,
    armed: std::cell::Cell<bool>,
}

impl StreamAccountGuard {
    pub fn new(pipeline: Pipeline, outcome: &PipelineOutcome) -> Self {
        Self {
            pipeline,
            api_key_secret: outcome.api_key_secret.clone(),
            model: outcome.model.clone(),
            session_email: outcome.session_email.clone(),
            total_tokens: std::cell::Cell::new(0),
            armed: std::cell::Cell::new(true),
        }
    }

    pub fn observe_tokens(&self, total_tokens: u64) {
        self.total_tokens.set(total_tokens);
    }

    /// Disarms the guard and accounts with the given terminal status. A
    /// no-op if already disarmed.
    pub fn finish(&self, upstream_status: u16) {
        if self.armed.replace(false) {
            self.pipeline.account(
                &self.api_key_secret,
                &self.model,
                self.session_email.as_deref(),
                upstream_status,
                self.total_tokens.get(),
            );
        }
    }
}

impl Drop for StreamAccountGuard {
    fn drop(&mut self) {
        if self.armed.get() {
            self.pipeline.account(
                &self.api_key_secret,
                &self.model,
                self.session_email.as_deref(),
                499,
                self.total_tokens.get(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::config::{QuotaConfig, RateLimitConfig, UsageConfig};
    use sa_domain::key::ApiKey;
    use sa_domain::repository::{InMemoryRepository, Repository};
    use sa_providers::registry::ProviderRegistry;
    use sa_sessions::SessionPool;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    async fn test_pipeline() -> (Pipeline, Arc<dyn Repository>) {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        repo.insert_key(ApiKey::new("sk-test", "test")).await.unwrap();
        let keys = Arc::new(KeyManager::load(repo.clone(), &[]).await.unwrap());
        let has_sessions = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(SessionPool::load(repo.clone(), has_sessions.clone()).await.unwrap());
        let quota = Arc::new(QuotaManager::new(pool, QuotaConfig::default(), true));
        let providers = Arc::new(
            ProviderRegistry::from_config(&sa_domain::config::ProvidersConfig::default(), has_sessions)
                .unwrap(),
        );
        let rate_limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1000,
            burst: 1000,
            idle_eviction_secs: 300,
        });
        let usage = Arc::new(UsageTracker::spawn(repo.clone(), UsageConfig {
            queue_capacity: 100,
            batch_size: 10,
            flush_interval_ms: 50,
            retention_days: 90,
            cleanup_time_utc: "03:00".into(),
        }));
        (
            Pipeline {
                rate_limiter,
                keys,
                quota,
                providers,
                usage,
            },
            repo,
        )
    }

    #[tokio::test]
    async fn unknown_key_is_rejected_at_stage_2() {
        let (pipeline, _repo) = test_pipeline().await;
        let req = PipelineRequest {
            client_ip: "127.0.0.1".parse().unwrap(),
            api_key_secret: "sk-missing".into(),
            requested_model: "gpt-4o".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            temperature: None,
            max_tokens: None,
            json_mode: false,
            stream: false,
        };
        let err = pipeline.run(req).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidApiKey));
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_at_stage_3() {
        let (pipeline, _repo) = test_pipeline().await;
        let req = PipelineRequest {
            client_ip: "127.0.0.1".parse().unwrap(),
            api_key_secret: "sk-test".into(),
            requested_model: "llama-70b".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            temperature: None,
            max_tokens: None,
            json_mode: false,
            stream: false,
        };
        let err = pipeline.run(req).await.unwrap_err();
        assert!(matches!(err, ApiError::UnknownModel(model) if model == "llama-70b"));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_rejected_at_stage_4() {
        let (pipeline, _repo) = test_pipeline().await;
        let req = PipelineRequest {
            client_ip: "127.0.0.1".parse().unwrap(),
            api_key_secret: "sk-test".into(),
            requested_model: "gpt-4o".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            temperature: None,
            max_tokens: None,
            json_mode: false,
            stream: false,
        };
        // No OPENAI_API_KEY configured in ProvidersConfig::default(), so
        // the provider isn't registered at all.
        let err = pipeline.run(req).await.unwrap_err();
        assert!(matches!(err, ApiError::ProviderNotAvailable(_)));
    }

    #[tokio::test]
    async fn rate_limited_caller_never_reaches_authentication() {
        let (mut pipeline, _repo) = test_pipeline().await;
        pipeline.rate_limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1,
            burst: 0,
            idle_eviction_secs: 300,
        });
        let req = PipelineRequest {
            client_ip: "127.0.0.1".parse().unwrap(),
            api_key_secret: "sk-missing".into(),
            requested_model: "gpt-4o".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            temperature: None,
            max_tokens: None,
            json_mode: false,
            stream: false,
        };
        let err = pipeline.run(req).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited));
    }
}
