//! The storage seam the core requires (§6: "repository operations").
//!
//! Everything upstream of this trait — Key Manager, Session Pool, Quota
//! Manager, Usage Tracker — talks only to [`Repository`]. The relational
//! schema behind a real repository is an external collaborator and out of
//! scope here; [`InMemoryRepository`] is the stand-in tests and a
//! standalone deployment use instead, per the "tests substitute in-memory
//! repositories" design note.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;
use crate::key::{ApiKey, BalanceStatus, KeyActiveCheck};
use crate::session::{CursorSession, QuotaStatus};
use crate::usage::UsageRecord;

#[async_trait]
pub trait Repository: Send + Sync {
    // ── Keys ────────────────────────────────────────────────────────
    async fn list_keys(&self) -> Result<Vec<ApiKey>>;
    async fn list_keys_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>>;
    async fn insert_key(&self, key: ApiKey) -> Result<()>;
    async fn soft_delete_key(&self, secret: &str) -> Result<()>;
    async fn toggle_key_active(&self, secret: &str, active: bool) -> Result<()>;
    async fn rename_key(&self, secret: &str, display_name: &str) -> Result<()>;
    async fn set_key_expiry(&self, secret: &str, expires_at: Option<DateTime<Utc>>) -> Result<()>;
    async fn set_key_spend_limit(&self, secret: &str, limit: Option<f64>) -> Result<()>;
    async fn increment_key_spend(&self, secret: &str, delta_usd: f64) -> Result<()>;
    async fn increment_key_usage(&self, secret: &str) -> Result<()>;
    async fn is_key_active_with_user(&self, secret: &str) -> Result<KeyActiveCheck>;
    async fn balance_status(&self, user_id: &str) -> Result<Option<BalanceStatus>>;

    // ── Cursor sessions ─────────────────────────────────────────────
    async fn list_sessions(&self) -> Result<Vec<CursorSession>>;
    async fn insert_session(&self, session: CursorSession) -> Result<()>;
    async fn delete_session(&self, email: &str) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    async fn update_session_health(
        &self,
        email: &str,
        valid: bool,
        failure_count: u32,
        last_used_at: Option<DateTime<Utc>>,
        last_checked_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn add_session_usage(
        &self,
        email: &str,
        delta_tokens: u64,
        status: QuotaStatus,
    ) -> Result<()>;
    async fn reset_session_quota(&self, email: &str, today: NaiveDate) -> Result<()>;
    async fn reset_all_session_quotas(&self, today: NaiveDate) -> Result<()>;
    async fn set_session_quota_limit(&self, email: &str, new_limit: u64) -> Result<()>;
    async fn sessions_needing_reset(&self, today: NaiveDate) -> Result<Vec<String>>;
    async fn expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
    async fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;

    // ── Usage records ───────────────────────────────────────────────
    async fn append_usage_records(&self, records: Vec<UsageRecord>) -> Result<()>;
    async fn purge_usage_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory [`Repository`] backed by `parking_lot::RwLock`-guarded maps.
/// Sufficient for tests and for running the gateway with no external store
/// configured.
#[derive(Default)]
pub struct InMemoryRepository {
    keys: RwLock<HashMap<String, ApiKey>>,
    balances: RwLock<HashMap<String, BalanceStatus>>,
    sessions: RwLock<HashMap<String, CursorSession>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance status for a user (test / bootstrap helper; not part
    /// of the `Repository` contract).
    pub fn set_balance_status(&self, user_id: impl Into<String>, status: BalanceStatus) {
        self.balances.write().insert(user_id.into(), status);
    }

    /// Snapshot of every stored usage record (test helper; not part of the
    /// `Repository` contract).
    pub fn list_usage_for_test(&self) -> Vec<UsageRecord> {
        self.usage.read().clone()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn list_keys(&self) -> Result<Vec<ApiKey>> {
        Ok(self.keys.read().values().cloned().collect())
    }

    async fn list_keys_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>> {
        Ok(self
            .keys
            .read()
            .values()
            .filter(|k| k.owner_user_id.as_deref() == Some(user_id))
            .cloned()
            .collect())
    }

    async fn insert_key(&self, key: ApiKey) -> Result<()> {
        self.keys.write().insert(key.secret.clone(), key);
        Ok(())
    }

    async fn soft_delete_key(&self, secret: &str) -> Result<()> {
        let mut keys = self.keys.write();
        match keys.get_mut(secret) {
            Some(k) => {
                k.active = false;
                Ok(())
            }
            None => Err(crate::error::Error::NotFound(secret.to_string())),
        }
    }

    async fn toggle_key_active(&self, secret: &str, active: bool) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(secret)
            .ok_or_else(|| crate::error::Error::NotFound(secret.to_string()))?;
        key.active = active;
        Ok(())
    }

    async fn rename_key(&self, secret: &str, display_name: &str) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(secret)
            .ok_or_else(|| crate::error::Error::NotFound(secret.to_string()))?;
        key.display_name = display_name.to_string();
        Ok(())
    }

    async fn set_key_expiry(&self, secret: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(secret)
            .ok_or_else(|| crate::error::Error::NotFound(secret.to_string()))?;
        key.expires_at = expires_at;
        Ok(())
    }

    async fn set_key_spend_limit(&self, secret: &str, limit: Option<f64>) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(secret)
            .ok_or_else(|| crate::error::Error::NotFound(secret.to_string()))?;
        key.spend_limit_usd = limit;
        Ok(())
    }

    async fn increment_key_spend(&self, secret: &str, delta_usd: f64) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(secret)
            .ok_or_else(|| crate::error::Error::NotFound(secret.to_string()))?;
        key.spend_used_usd += delta_usd;
        Ok(())
    }

    async fn increment_key_usage(&self, secret: &str) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(secret)
            .ok_or_else(|| crate::error::Error::NotFound(secret.to_string()))?;
        key.usage_count += 1;
        key.last_used_at = Some(Utc::now());
        Ok(())
    }

    async fn is_key_active_with_user(&self, secret: &str) -> Result<KeyActiveCheck> {
        let keys = self.keys.read();
        match keys.get(secret) {
            None => Ok(KeyActiveCheck::NotFound),
            Some(k) if !k.active => Ok(KeyActiveCheck::Inactive),
            Some(_) => Ok(KeyActiveCheck::Active),
        }
    }

    async fn balance_status(&self, user_id: &str) -> Result<Option<BalanceStatus>> {
        Ok(self.balances.read().get(user_id).copied())
    }

    async fn list_sessions(&self) -> Result<Vec<CursorSession>> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    async fn insert_session(&self, session: CursorSession) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.email) {
            return Err(crate::error::Error::Repository(
                "duplicate session email".into(),
            ));
        }
        sessions.insert(session.email.clone(), session);
        Ok(())
    }

    async fn delete_session(&self, email: &str) -> Result<()> {
        self.sessions.write().remove(email);
        Ok(())
    }

    async fn update_session_health(
        &self,
        email: &str,
        valid: bool,
        failure_count: u32,
        last_used_at: Option<DateTime<Utc>>,
        last_checked_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(email)
            .ok_or_else(|| crate::error::Error::NotFound(email.to_string()))?;
        session.valid = valid;
        session.failure_count = failure_count;
        if last_used_at.is_some() {
            session.last_used_at = last_used_at;
        }
        if last_checked_at.is_some() {
            session.last_checked_at = last_checked_at;
        }
        Ok(())
    }

    async fn add_session_usage(
        &self,
        email: &str,
        delta_tokens: u64,
        status: QuotaStatus,
    ) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(email)
            .ok_or_else(|| crate::error::Error::NotFound(email.to_string()))?;
        session.tokens_consumed_today += delta_tokens;
        session.usage_count += 1;
        session.valid = status != QuotaStatus::Exhausted || session.valid;
        Ok(())
    }

    async fn reset_session_quota(&self, email: &str, today: NaiveDate) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(email)
            .ok_or_else(|| crate::error::Error::NotFound(email.to_string()))?;
        session.tokens_consumed_today = 0;
        session.last_reset_date = today;
        Ok(())
    }

    async fn reset_all_session_quotas(&self, today: NaiveDate) -> Result<()> {
        let mut sessions = self.sessions.write();
        for session in sessions.values_mut() {
            session.tokens_consumed_today = 0;
            session.last_reset_date = today;
        }
        Ok(())
    }

    async fn set_session_quota_limit(&self, email: &str, new_limit: u64) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(email)
            .ok_or_else(|| crate::error::Error::NotFound(email.to_string()))?;
        session.daily_limit = new_limit;
        if session.tokens_consumed_today >= new_limit {
            session.valid = false;
        }
        Ok(())
    }

    async fn sessions_needing_reset(&self, today: NaiveDate) -> Result<Vec<String>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.last_reset_date < today)
            .map(|s| s.email.clone())
            .collect())
    }

    async fn expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.email.clone())
            .collect())
    }

    async fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.expired_sessions(now).await?;
        let mut sessions = self.sessions.write();
        for email in &expired {
            sessions.remove(email);
        }
        Ok(expired.len() as u64)
    }

    async fn append_usage_records(&self, records: Vec<UsageRecord>) -> Result<()> {
        self.usage.write().extend(records);
        Ok(())
    }

    async fn purge_usage_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut usage = self.usage.write();
        let before = usage.len();
        usage.retain(|r| r.timestamp >= cutoff);
        Ok((before - usage.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AccountType;

    #[tokio::test]
    async fn insert_and_list_keys() {
        let repo = InMemoryRepository::new();
        repo.insert_key(ApiKey::new("sk-1", "first")).await.unwrap();
        let keys = repo.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_key_deactivates_regardless_of_count() {
        // The repository is an opaque CRUD store — duplicate-secret and
        // last-remaining-key invariants are enforced by `KeyManager`, not
        // here (see `sa_gateway::key_manager` tests).
        let repo = InMemoryRepository::new();
        repo.insert_key(ApiKey::new("sk-1", "only")).await.unwrap();
        repo.soft_delete_key("sk-1").await.unwrap();
        let keys = repo.list_keys().await.unwrap();
        assert!(!keys[0].active);
    }

    #[tokio::test]
    async fn is_key_active_with_user_not_found() {
        let repo = InMemoryRepository::new();
        let result = repo.is_key_active_with_user("missing").await.unwrap();
        assert_eq!(result, KeyActiveCheck::NotFound);
    }

    #[tokio::test]
    async fn session_quota_reset_clears_counter() {
        let repo = InMemoryRepository::new();
        let mut s = CursorSession::new("a@example.com", "tok", AccountType::Free, 1000);
        s.tokens_consumed_today = 900;
        repo.insert_session(s).await.unwrap();
        repo.reset_session_quota("a@example.com", Utc::now().date_naive())
            .await
            .unwrap();
        let sessions = repo.list_sessions().await.unwrap();
        assert_eq!(sessions[0].tokens_consumed_today, 0);
    }

    #[tokio::test]
    async fn purge_usage_older_than_removes_stale_records() {
        let repo = InMemoryRepository::new();
        let mut old = UsageRecord::new("sk-1", "gpt-4o", 200);
        old.timestamp = Utc::now() - chrono::Duration::days(100);
        let fresh = UsageRecord::new("sk-1", "gpt-4o", 200);
        repo.append_usage_records(vec![old, fresh]).await.unwrap();
        let purged = repo
            .purge_usage_older_than(Utc::now() - chrono::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }
}
