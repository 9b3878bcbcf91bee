//! Scheduler (§4.7): four independently-stoppable periodic tasks —
//! session health checks, session eviction, daily quota reset, and usage
//! cleanup. Each runs as its own `tokio::spawn`'d loop cancelled by a
//! shared [`CancellationToken`] so the whole scheduler can be stopped as a
//! unit (tests, graceful shutdown) without tearing down the rest of the
//! process.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use sa_domain::config::{QuotaConfig, UsageConfig};
use sa_domain::repository::Repository;
use sa_sessions::pool::ProbeOutcome;
use sa_sessions::SessionPool;
use tokio_util::sync::CancellationToken;

use crate::quota::QuotaManager;

const PROBE_URL: &str = "https://cursor.com/api/user";

pub struct Scheduler {
    token: CancellationToken,
}

impl Scheduler {
    /// Start all four periodic tasks. On startup: does *not* run eviction
    /// (clock-skew protection) but does reset any session whose
    /// `last_reset_date` has already fallen behind today.
    pub async fn start(
        pool: Arc<SessionPool>,
        quota: Arc<QuotaManager>,
        repo: Arc<dyn Repository>,
        quota_config: QuotaConfig,
        usage_config: UsageConfig,
        http: reqwest::Client,
    ) -> Self {
        let token = CancellationToken::new();

        reset_stale_sessions_at_startup(&pool, &quota).await;

        spawn_health_check(pool.clone(), http, quota_config.clone(), token.clone());
        spawn_session_eviction(pool.clone(), quota_config.clone(), token.clone());
        spawn_quota_reset(quota.clone(), quota_config.clone(), token.clone());
        spawn_usage_cleanup(repo, usage_config, token.clone());

        Self { token }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

async fn reset_stale_sessions_at_startup(pool: &SessionPool, quota: &QuotaManager) {
    let today = Utc::now().date_naive();
    let stale = pool.sessions_needing_reset(today);
    for email in &stale {
        if let Err(e) = pool.reset_quota_through_repo(email, today).await {
            tracing::warn!(%email, error = %e, "startup quota reset failed");
        }
    }
    if !stale.is_empty() {
        if let Err(e) = pool.reload().await {
            tracing::warn!(error = %e, "pool reload after startup reset failed");
        }
    }
    let _ = quota;
}

/// Every `health_check_interval_secs` (default 1800s): probe any session
/// whose `last_checked_at` is stale, via `GET https://cursor.com/api/user`.
fn spawn_health_check(
    pool: Arc<SessionPool>,
    http: reqwest::Client,
    config: QuotaConfig,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.health_check_interval_secs));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    for session in pool.sessions_needing_probe(now) {
                        let outcome = probe_session(&http, &session.bearer_token).await;
                        pool.apply_probe_result(&session.email, outcome);
                    }
                }
            }
        }
    });
}

async fn probe_session(http: &reqwest::Client, bearer_token: &str) -> ProbeOutcome {
    let result = http
        .get(PROBE_URL)
        .header("Cookie", format!("cursor_session={bearer_token}"))
        .timeout(Duration::from_secs(30))
        .send()
        .await;
    match result {
        Ok(resp) if resp.status() == StatusCode::OK || resp.status() == StatusCode::NOT_FOUND => {
            ProbeOutcome::Valid
        }
        Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN => {
            ProbeOutcome::Invalid
        }
        _ => ProbeOutcome::Unchanged,
    }
}

/// Every `eviction_interval_secs` (default 24h): remove sessions past
/// expiry. Never runs at startup.
fn spawn_session_eviction(pool: Arc<SessionPool>, config: QuotaConfig, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.eviction_interval_secs));
        ticker.tick().await; // consume the immediate first tick — never evict at startup
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    match pool.evict_expired().await {
                        Ok(0) => {}
                        Ok(n) => {
                            tracing::info!(removed = n, "evicted expired sessions");
                            sa_domain::trace::TraceEvent::SchedulerTick {
                                task: "session_eviction",
                                affected: n as usize,
                            }
                            .emit();
                        }
                        Err(e) => tracing::warn!(error = %e, "session eviction failed"),
                    }
                }
            }
        }
    });
}

/// Daily at `daily_reset_hour_utc`: zero every session's quota counter.
fn spawn_quota_reset(quota: Arc<QuotaManager>, config: QuotaConfig, token: CancellationToken) {
    tokio::spawn(async move {
        let mut last_run = Utc::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if sa_sessions::crossed_hour_boundary(last_run, now, config.daily_reset_hour_utc as u8) {
                        match quota.reset_all_session_quotas().await {
                            Ok(()) => tracing::info!("daily quota reset complete"),
                            Err(e) => tracing::warn!(error = %e, "daily quota reset failed"),
                        }
                    }
                    last_run = now;
                }
            }
        }
    });
}

/// Daily at `cleanup_time_utc`: purge usage records past `retention_days`.
fn spawn_usage_cleanup(repo: Arc<dyn Repository>, config: UsageConfig, token: CancellationToken) {
    let cleanup_hour: u8 = config
        .cleanup_time_utc
        .split(':')
        .next()
        .and_then(|h| h.parse().ok())
        .unwrap_or(3);

    tokio::spawn(async move {
        let mut last_run = Utc::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if sa_sessions::crossed_hour_boundary(last_run, now, cleanup_hour) {
                        let cutoff = now - chrono::Duration::days(config.retention_days);
                        match repo.purge_usage_older_than(cutoff).await {
                            Ok(n) => {
                                tracing::info!(purged = n, "usage records purged");
                                sa_domain::trace::TraceEvent::SchedulerTick {
                                    task: "usage_cleanup",
                                    affected: n as usize,
                                }
                                .emit();
                            }
                            Err(e) => tracing::warn!(error = %e, "usage cleanup failed"),
                        }
                    }
                    last_run = now;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::repository::InMemoryRepository;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn startup_resets_stale_sessions_but_does_not_evict() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let mut stale = sa_domain::session::CursorSession::new(
            "a@x.com",
            "tok",
            sa_domain::session::AccountType::Free,
            1000,
        );
        stale.tokens_consumed_today = 999;
        stale.last_reset_date = (Utc::now() - chrono::Duration::days(1)).date_naive();
        repo.insert_session(stale).await.unwrap();

        let has_sessions = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(SessionPool::load(repo.clone(), has_sessions).await.unwrap());
        let quota = Arc::new(QuotaManager::new(pool.clone(), QuotaConfig::default(), true));

        reset_stale_sessions_at_startup(&pool, &quota).await;

        let session = pool.get("a@x.com").unwrap();
        assert_eq!(session.tokens_consumed_today, 0);
        assert_eq!(session.last_reset_date, Utc::now().date_naive());
    }
}
