//! Cursor Session Pool (§4.2).
//!
//! Singleton, mutex-protected. Holds every known [`CursorSession`] plus a
//! derived ordered slice of currently-valid sessions used for round-robin
//! selection. All state transitions happen synchronously under the lock;
//! the matching repository write is fire-and-forget so a slow store never
//! blocks a request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use sa_domain::repository::Repository;
use sa_domain::session::CursorSession;

/// Outcome of the 30-minute health probe against `cursor.com/api/user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid,
    Invalid,
    Unchanged,
}

/// Failures before a session is marked invalid by the health state machine.
pub const MAX_FAILURE_COUNT: u32 = 3;

pub struct SessionPool {
    repo: Arc<dyn Repository>,
    sessions: RwLock<HashMap<String, CursorSession>>,
    /// Emails of currently-valid sessions, in round-robin order.
    valid_order: RwLock<Vec<String>>,
    next_index: AtomicUsize,
    /// Shared with [`crate`] consumers (the provider registry) so the
    /// Cursor adapter's `is_available()` reflects pool state without polling.
    has_sessions: Arc<AtomicBool>,
}

impl SessionPool {
    /// Load every session from the repository and build the valid slice.
    pub async fn load(repo: Arc<dyn Repository>, has_sessions: Arc<AtomicBool>) -> sa_domain::Result<Self> {
        let sessions = repo.list_sessions().await?;
        let pool = Self {
            repo,
            sessions: RwLock::new(HashMap::new()),
            valid_order: RwLock::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            has_sessions,
        };
        pool.reload_from(sessions);
        Ok(pool)
    }

    fn reload_from(&self, sessions: Vec<CursorSession>) {
        let mut map = self.sessions.write();
        map.clear();
        for session in sessions {
            map.insert(session.email.clone(), session);
        }
        drop(map);
        self.rebuild_valid_order();
    }

    /// Atomically swap in a fresh snapshot from the repository.
    pub async fn reload(&self) -> sa_domain::Result<()> {
        let sessions = self.repo.list_sessions().await?;
        self.reload_from(sessions);
        Ok(())
    }

    fn rebuild_valid_order(&self) {
        let map = self.sessions.read();
        let now = Utc::now();
        let mut order: Vec<(u64, String)> = map
            .values()
            .filter(|s| s.valid && !s.is_expired(now))
            .map(|s| (s.sequence, s.email.clone()))
            .collect();
        order.sort_by_key(|(seq, _)| *seq);
        let order: Vec<String> = order.into_iter().map(|(_, email)| email).collect();
        drop(map);
        *self.valid_order.write() = order;
        self.has_sessions
            .store(!self.valid_order.read().is_empty(), Ordering::Relaxed);
    }

    /// Round-robin selection over the valid slice, ordered by insertion
    /// sequence and rebuilt after every mutation.
    pub fn next(&self) -> Option<CursorSession> {
        let order = self.valid_order.read();
        if order.is_empty() {
            return None;
        }
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % order.len();
        let email = &order[idx];
        self.sessions.read().get(email).cloned()
    }

    pub fn get(&self, email: &str) -> Option<CursorSession> {
        self.sessions.read().get(email).cloned()
    }

    /// `List()`: copies with secrets masked, per §4.2.
    pub fn list(&self) -> Vec<CursorSession> {
        self.sessions.read().values().map(|s| s.masked()).collect()
    }

    pub fn add(&self, session: CursorSession) {
        let email = session.email.clone();
        self.sessions.write().insert(email.clone(), session.clone());
        self.rebuild_valid_order();
        let repo = self.repo.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.insert_session(session).await {
                tracing::warn!(%email, error = %e, "failed to persist new session");
            }
        });
    }

    pub fn remove(&self, email: &str) {
        self.sessions.write().remove(email);
        self.rebuild_valid_order();
        let repo = self.repo.clone();
        let email = email.to_string();
        tokio::spawn(async move {
            if let Err(e) = repo.delete_session(&email).await {
                tracing::warn!(%email, error = %e, "failed to persist session removal");
            }
        });
    }

    /// On upstream HTTP 401/403: failure-count++, ≥3 ⇒ invalid.
    pub fn mark_http_unauthorized(&self, email: &str) {
        let updated = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(email) {
                Some(s) => {
                    let previous_valid = s.valid;
                    s.failure_count += 1;
                    if s.failure_count >= MAX_FAILURE_COUNT {
                        s.valid = false;
                    }
                    Some((previous_valid, s.valid, s.failure_count))
                }
                None => None,
            }
        };
        if let Some((previous_valid, valid, failure_count)) = updated {
            self.rebuild_valid_order();
            self.persist_health(email);
            sa_domain::trace::TraceEvent::SessionHealthTransition {
                email: email.to_string(),
                previous_valid,
                valid,
                failure_count,
                cause: "http_unauthorized",
            }
            .emit();
        }
    }

    /// On upstream success: failure-count resets, session marked valid,
    /// usage-count increments and `last_used_at` is touched.
    pub fn mark_success(&self, email: &str) {
        let now = Utc::now();
        let changed = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(email) {
                Some(s) => {
                    let previous_valid = s.valid;
                    s.failure_count = 0;
                    s.valid = true;
                    s.usage_count += 1;
                    s.last_used_at = Some(now);
                    Some(previous_valid)
                }
                None => None,
            }
        };
        if let Some(previous_valid) = changed {
            self.rebuild_valid_order();
            self.persist_health(email);
            if !previous_valid {
                sa_domain::trace::TraceEvent::SessionHealthTransition {
                    email: email.to_string(),
                    previous_valid,
                    valid: true,
                    failure_count: 0,
                    cause: "http_success",
                }
                .emit();
            }
        }
    }

    /// Any other upstream error leaves the failure-count unchanged.
    pub fn mark_other_error(&self, _email: &str) {}

    /// Apply the result of the periodic health probe. `200`/`404` ⇒ valid,
    /// `401`/`403` ⇒ invalid, anything else leaves validity unchanged —
    /// `last_checked_at` is always refreshed.
    pub fn apply_probe_result(&self, email: &str, outcome: ProbeOutcome) {
        let now = Utc::now();
        let changed = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(email) {
                Some(s) => {
                    let previous_valid = s.valid;
                    match outcome {
                        ProbeOutcome::Valid => {
                            s.valid = true;
                            s.failure_count = 0;
                        }
                        ProbeOutcome::Invalid => s.valid = false,
                        ProbeOutcome::Unchanged => {}
                    }
                    s.last_checked_at = Some(now);
                    Some((previous_valid, s.valid, s.failure_count))
                }
                None => None,
            }
        };
        if let Some((previous_valid, valid, failure_count)) = changed {
            self.rebuild_valid_order();
            self.persist_health(email);
            if previous_valid != valid {
                sa_domain::trace::TraceEvent::SessionHealthTransition {
                    email: email.to_string(),
                    previous_valid,
                    valid,
                    failure_count,
                    cause: "health_probe",
                }
                .emit();
            }
        }
    }

    fn persist_health(&self, email: &str) {
        let (valid, failure_count, last_used_at, last_checked_at) = {
            let sessions = self.sessions.read();
            match sessions.get(email) {
                Some(s) => (s.valid, s.failure_count, s.last_used_at, s.last_checked_at),
                None => return,
            }
        };
        let repo = self.repo.clone();
        let email = email.to_string();
        tokio::spawn(async move {
            if let Err(e) = repo
                .update_session_health(&email, valid, failure_count, last_used_at, last_checked_at)
                .await
            {
                tracing::warn!(%email, error = %e, "failed to persist session health");
            }
        });
    }

    /// Sessions whose `last_checked_at` is more than 15 minutes stale (or
    /// has never been checked) — candidates for the 30-minute health probe.
    pub fn sessions_needing_probe(&self, now: DateTime<Utc>) -> Vec<CursorSession> {
        let threshold = now - chrono::Duration::minutes(15);
        self.sessions
            .read()
            .values()
            .filter(|s| s.last_checked_at.map_or(true, |t| t < threshold))
            .cloned()
            .collect()
    }

    /// Raw (unmasked) snapshot of every session, for the Quota Manager's
    /// internal selection logic. Never exposed across an API boundary —
    /// external callers use [`SessionPool::list`] instead.
    pub fn list_active_raw(&self) -> Vec<CursorSession> {
        self.sessions.read().values().cloned().collect()
    }

    /// Emails whose `last_reset_date` has fallen behind `today`.
    pub fn sessions_needing_reset(&self, today: chrono::NaiveDate) -> Vec<String> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.last_reset_date < today)
            .map(|s| s.email.clone())
            .collect()
    }

    /// Reset one session's daily quota counter through the repository,
    /// then mirror the change into memory.
    pub async fn reset_quota_through_repo(
        &self,
        email: &str,
        today: chrono::NaiveDate,
    ) -> sa_domain::Result<()> {
        self.repo.reset_session_quota(email, today).await?;
        if let Some(s) = self.sessions.write().get_mut(email) {
            s.tokens_consumed_today = 0;
            s.last_reset_date = today;
        }
        self.rebuild_valid_order();
        sa_domain::trace::TraceEvent::SessionQuotaReset {
            email: email.to_string(),
        }
        .emit();
        Ok(())
    }

    /// Reset every session's daily quota counter through the repository.
    /// Callers typically follow this with [`SessionPool::reload`].
    pub async fn reset_all_quotas_through_repo(&self, today: chrono::NaiveDate) -> sa_domain::Result<()> {
        self.repo.reset_all_session_quotas(today).await
    }

    /// Admin-only: write a new daily limit through the repository.
    pub async fn set_quota_limit_through_repo(&self, email: &str, new_limit: u64) -> sa_domain::Result<()> {
        self.repo.set_session_quota_limit(email, new_limit).await
    }

    /// Add `delta_tokens` to a session's running daily counter under the
    /// write lock, recompute its quota status, and return the new total
    /// plus status for the caller to persist. Returns `None` if the
    /// session is unknown.
    pub fn add_usage_local(
        &self,
        email: &str,
        delta_tokens: u64,
        low_threshold: f64,
    ) -> Option<(u64, sa_domain::session::QuotaStatus)> {
        let result = {
            let mut sessions = self.sessions.write();
            let s = sessions.get_mut(email)?;
            s.tokens_consumed_today += delta_tokens;
            s.usage_count += 1;
            let status = s.quota_status(low_threshold);
            if status == sa_domain::session::QuotaStatus::Exhausted {
                s.valid = false;
            }
            Some((s.tokens_consumed_today, status))
        };
        if result.is_some() {
            self.rebuild_valid_order();
        }
        result
    }

    /// Persist a usage delta + recomputed status through the repository.
    pub async fn persist_usage_through_repo(
        &self,
        email: &str,
        delta_tokens: u64,
        status: sa_domain::session::QuotaStatus,
    ) -> sa_domain::Result<()> {
        self.repo.add_session_usage(email, delta_tokens, status).await
    }

    /// Daily eviction (§4.2, §4.7): delete sessions past expiry from the
    /// repository, then from memory. Never run at startup.
    pub async fn evict_expired(&self) -> sa_domain::Result<u64> {
        let now = Utc::now();
        let expired = self.repo.expired_sessions(now).await?;
        for email in &expired {
            tracing::info!(%email, "evicting expired Cursor session");
            let expiry = self
                .sessions
                .read()
                .get(email)
                .and_then(|s| s.expires_at)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            sa_domain::trace::TraceEvent::SessionEvicted {
                email: email.clone(),
                expiry,
            }
            .emit();
        }
        let removed = self.repo.cleanup_expired_sessions(now).await?;
        if removed > 0 {
            self.sessions.write().retain(|_, s| !s.is_expired(now));
            self.rebuild_valid_order();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::repository::InMemoryRepository;
    use sa_domain::session::AccountType;

    async fn pool_with(sessions: Vec<CursorSession>) -> SessionPool {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        for s in &sessions {
            repo.insert_session(s.clone()).await.unwrap();
        }
        let has_sessions = Arc::new(AtomicBool::new(false));
        SessionPool::load(repo, has_sessions).await.unwrap()
    }

    #[tokio::test]
    async fn round_robin_cycles_through_valid_sessions() {
        let a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        let b = CursorSession::new("b@x.com", "tok-b", AccountType::Free, 1000);
        let pool = pool_with(vec![a, b]).await;

        let first = pool.next().unwrap().email;
        let second = pool.next().unwrap().email;
        let third = pool.next().unwrap().email;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn valid_order_follows_insertion_not_alphabetical_order() {
        // "z@x.com" is inserted first, "a@x.com" second — a naive sort by
        // email would reverse this.
        let z = CursorSession::new("z@x.com", "tok-z", AccountType::Free, 1000);
        let a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        let pool = pool_with(vec![z, a]).await;

        let first = pool.next().unwrap().email;
        let second = pool.next().unwrap().email;
        assert_eq!(first, "z@x.com");
        assert_eq!(second, "a@x.com");
    }

    #[tokio::test]
    async fn three_unauthorized_failures_invalidate_session() {
        let a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        let pool = pool_with(vec![a]).await;

        pool.mark_http_unauthorized("a@x.com");
        pool.mark_http_unauthorized("a@x.com");
        assert!(pool.get("a@x.com").unwrap().valid);
        pool.mark_http_unauthorized("a@x.com");
        assert!(!pool.get("a@x.com").unwrap().valid);
        assert!(pool.next().is_none());
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        let pool = pool_with(vec![a]).await;
        pool.mark_http_unauthorized("a@x.com");
        pool.mark_success("a@x.com");
        let s = pool.get("a@x.com").unwrap();
        assert_eq!(s.failure_count, 0);
        assert!(s.valid);
        assert_eq!(s.usage_count, 1);
    }

    #[tokio::test]
    async fn probe_404_counts_as_valid() {
        let mut a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        a.valid = false;
        let pool = pool_with(vec![a]).await;
        pool.apply_probe_result("a@x.com", ProbeOutcome::Valid);
        assert!(pool.get("a@x.com").unwrap().valid);
    }

    #[tokio::test]
    async fn list_masks_tokens() {
        let a = CursorSession::new("a@x.com", "abcdefghijklmnop", AccountType::Free, 1000);
        let pool = pool_with(vec![a]).await;
        let listed = pool.list();
        assert_eq!(listed.len(), 1);
        assert_ne!(listed[0].bearer_token, "abcdefghijklmnop");
    }

    #[tokio::test]
    async fn has_sessions_flag_tracks_pool_state() {
        let has_sessions = Arc::new(AtomicBool::new(false));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let pool = SessionPool::load(repo, has_sessions.clone()).await.unwrap();
        assert!(!has_sessions.load(Ordering::Relaxed));

        let a = CursorSession::new("a@x.com", "tok-a", AccountType::Free, 1000);
        pool.add(a);
        assert!(has_sessions.load(Ordering::Relaxed));
    }
}
