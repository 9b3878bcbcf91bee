use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sa_domain::config::Config;
use sa_domain::repository::Repository;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::SessionPool;

use crate::key_manager::KeyManager;
use crate::pipeline::Pipeline;
use crate::quota::QuotaManager;
use crate::rate_limit::RateLimiter;
use crate::usage_tracker::UsageTracker;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub keys: Arc<KeyManager>,
    pub sessions: Arc<SessionPool>,
    pub quota: Arc<QuotaManager>,
    pub usage: Arc<UsageTracker>,
    pub providers: Arc<ProviderRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Shared with the Cursor provider adapter so `is_available()` reflects
    /// pool state without polling.
    pub has_cursor_sessions: Arc<AtomicBool>,
    /// `Some(Sha256 digest)` when `ADMIN_KEY` is configured; `None`
    /// disables the admin surface entirely (see `AdminConfig::admin_key`).
    pub admin_key_hash: Option<Vec<u8>>,
}

impl AppState {
    /// Build a [`Pipeline`] handle. Cheap: every field is an `Arc` clone.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            rate_limiter: self.rate_limiter.clone(),
            keys: self.keys.clone(),
            quota: self.quota.clone(),
            providers: self.providers.clone(),
            usage: self.usage.clone(),
        }
    }
}
