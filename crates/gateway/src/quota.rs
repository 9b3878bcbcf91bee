//! Quota Manager (§4.3).
//!
//! Wraps the Cursor [`SessionPool`] with only a read-reference — every
//! mutation it needs is routed through the pool's own named operations, so
//! the two never hold overlapping locks (see the cyclic-reference design
//! note).

use std::sync::Arc;

use chrono::Utc;
use sa_domain::config::QuotaConfig;
use sa_domain::session::{CursorSession, QuotaStatus};
use sa_sessions::SessionPool;

pub struct QuotaManager {
    pool: Arc<SessionPool>,
    config: QuotaConfig,
    enabled: bool,
    round_robin: std::sync::atomic::AtomicUsize,
}

#[derive(Debug)]
pub enum SelectError {
    AllExhausted,
}

impl QuotaManager {
    pub fn new(pool: Arc<SessionPool>, config: QuotaConfig, enabled: bool) -> Self {
        Self {
            pool,
            config,
            enabled,
            round_robin: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// `EstimateRequestTokens`: 4 chars ≈ 1 token, rounded up, scaled by the
    /// configured over-estimation multiplier so a session trends toward
    /// exhausted even if the upstream under-reports usage.
    pub fn estimate_request_tokens(&self, messages: &[sa_domain::tool::Message]) -> u64 {
        let chars: usize = messages
            .iter()
            .map(|m| m.content.extract_all_text().len())
            .sum();
        let raw = (chars as f64 / self.config.chars_per_token).ceil();
        (raw * self.config.token_estimate_multiplier).ceil() as u64
    }

    /// `SelectSessionForRequest(estimatedTokens)`. If quota tracking is
    /// disabled this delegates straight to the pool's round-robin. Sessions
    /// whose `last_reset_date` has fallen behind today are reset through
    /// the repository and the pool reloaded before selection runs.
    pub async fn select_session_for_request(
        &self,
        estimated_tokens: u64,
    ) -> Result<CursorSession, SelectError> {
        if !self.enabled {
            return self.pool.next().ok_or(SelectError::AllExhausted);
        }

        self.reset_stale_sessions().await;

        let now = Utc::now();
        let candidates: Vec<CursorSession> = self
            .pool
            .list_active_raw()
            .into_iter()
            .filter(|s| s.valid && !s.is_expired(now))
            .collect();

        let mut can_serve = Vec::new();
        let mut degraded = Vec::new();
        for s in candidates {
            let status = s.quota_status(self.config.low_threshold);
            if status == QuotaStatus::Exhausted {
                continue;
            }
            if s.remaining() >= estimated_tokens {
                can_serve.push(s);
            } else {
                degraded.push(s);
            }
        }

        if !can_serve.is_empty() {
            let picked = self.pick_best(can_serve);
            self.emit_selected(&picked, "can_serve");
            return Ok(picked);
        }
        if !degraded.is_empty() {
            tracing::warn!(
                estimated_tokens,
                "no session can serve the full estimate, picking best-effort degraded session"
            );
            let picked = self.pick_best(degraded);
            self.emit_selected(&picked, "degraded");
            return Ok(picked);
        }
        Err(SelectError::AllExhausted)
    }

    fn emit_selected(&self, session: &CursorSession, partition: &'static str) {
        sa_domain::trace::TraceEvent::SessionSelected {
            email: session.email.clone(),
            partition,
            remaining_fraction: session.remaining_fraction(),
        }
        .emit();
    }

    /// Highest remaining-fraction wins; candidates within `tie_margin` of
    /// each other are treated as tied and broken by round-robin.
    fn pick_best(&self, mut candidates: Vec<CursorSession>) -> CursorSession {
        candidates.sort_by(|a, b| {
            b.remaining_fraction()
                .partial_cmp(&a.remaining_fraction())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let best_fraction = candidates[0].remaining_fraction();
        let tied: Vec<&CursorSession> = candidates
            .iter()
            .take_while(|s| best_fraction - s.remaining_fraction() <= self.config.tie_margin)
            .collect();
        let idx = self
            .round_robin
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % tied.len();
        tied[idx].clone()
    }

    async fn reset_stale_sessions(&self) {
        let today = Utc::now().date_naive();
        match self.pool.sessions_needing_reset(today) {
            emails if !emails.is_empty() => {
                for email in &emails {
                    if let Err(e) = self.pool.reset_quota_through_repo(email, today).await {
                        tracing::warn!(%email, error = %e, "failed to reset session quota");
                    }
                }
                if let Err(e) = self.pool.reload().await {
                    tracing::warn!(error = %e, "failed to reload session pool after quota reset");
                }
            }
            _ => {}
        }
    }

    /// `TrackUsage(session, usage)`: in-memory counter is the source of
    /// truth between flushes; the repository write happens on a detached
    /// task with exponential backoff.
    pub fn track_usage(&self, email: &str, total_tokens: u64) {
        let Some((new_total, status)) = self.pool.add_usage_local(email, total_tokens, self.config.low_threshold)
        else {
            return;
        };
        tracing::info!(%email, tokens_consumed_today = new_total, ?status, "session usage tracked");
        sa_domain::trace::TraceEvent::UsageTracked {
            email: email.to_string(),
            delta_tokens: total_tokens as u32,
            status: match status {
                QuotaStatus::Available => "available",
                QuotaStatus::Low => "low",
                QuotaStatus::Exhausted => "exhausted",
            },
        }
        .emit();
        let pool = self.pool.clone();
        let email = email.to_string();
        tokio::spawn(async move {
            persist_usage_with_backoff(&pool, &email, total_tokens, status).await;
        });
    }

    /// `ResetAllSessionQuotas()`: the daily reset scheduler task.
    pub async fn reset_all_session_quotas(&self) -> sa_domain::Result<()> {
        self.pool.reset_all_quotas_through_repo(Utc::now().date_naive()).await?;
        self.pool.reload().await
    }

    /// `UpdateSessionQuota(email, newLimit)`: admin-only.
    pub async fn update_session_quota(&self, email: &str, new_limit: u64) -> sa_domain::Result<()> {
        self.pool.set_quota_limit_through_repo(email, new_limit).await?;
        self.pool.reload().await
    }
}

async fn persist_usage_with_backoff(
    pool: &SessionPool,
    email: &str,
    delta_tokens: u64,
    status: QuotaStatus,
) {
    const MAX_RETRIES: u32 = 5;
    let mut attempt = 0;
    loop {
        match pool.persist_usage_through_repo(email, delta_tokens, status).await {
            Ok(()) => return,
            Err(e) if attempt < MAX_RETRIES => {
                attempt += 1;
                let backoff = std::time::Duration::from_millis(100 * 2u64.pow(attempt));
                tracing::warn!(%email, attempt, error = %e, "usage persist failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                tracing::error!(%email, error = %e, "usage persist failed after max retries, dropping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::repository::{InMemoryRepository, Repository};
    use sa_domain::session::AccountType;
    use std::sync::atomic::AtomicBool;

    async fn manager_with(sessions: Vec<CursorSession>, enabled: bool) -> QuotaManager {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        for s in &sessions {
            repo.insert_session(s.clone()).await.unwrap();
        }
        let has_sessions = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(SessionPool::load(repo, has_sessions).await.unwrap());
        QuotaManager::new(pool, QuotaConfig::default(), enabled)
    }

    #[tokio::test]
    async fn disabled_quota_delegates_to_round_robin() {
        let a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        let mgr = manager_with(vec![a], false).await;
        assert!(mgr.select_session_for_request(10).await.is_ok());
    }

    #[tokio::test]
    async fn exhausted_sessions_produce_all_exhausted_error() {
        let mut a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        a.tokens_consumed_today = 1000;
        let mgr = manager_with(vec![a], true).await;
        let result = mgr.select_session_for_request(10).await;
        assert!(matches!(result, Err(SelectError::AllExhausted)));
    }

    #[tokio::test]
    async fn prefers_session_that_can_serve_full_estimate() {
        let mut low = CursorSession::new("low@x.com", "tok-low", AccountType::Free, 1000);
        low.tokens_consumed_today = 950;
        let high = CursorSession::new("high@x.com", "tok-high", AccountType::Free, 1000);
        let mgr = manager_with(vec![low, high], true).await;
        let selected = mgr.select_session_for_request(100).await.unwrap();
        assert_eq!(selected.email, "high@x.com");
    }

    #[tokio::test]
    async fn estimate_scales_by_configured_multiplier() {
        let mgr = manager_with(vec![], true).await;
        let messages = vec![sa_domain::tool::Message::user("a".repeat(400))];
        // 400 chars / 4 chars-per-token = 100 tokens, * 1.5 multiplier = 150.
        assert_eq!(mgr.estimate_request_tokens(&messages), 150);
    }
}
