//! API Key Manager (§4.1).
//!
//! Process-wide, mutex-protected secret→key map. Validation runs entirely
//! in memory; `ValidateForRequest` composes balance, spend-quota, expiry,
//! and model-allowlist checks in a fixed order so the first failure always
//! wins, giving callers a deterministic error.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use sa_domain::error::{Error, Result};
use sa_domain::key::{ApiKey, BalanceStatus, KeyActiveCheck};
use sa_domain::repository::Repository;

/// Outcome of [`KeyManager::validate_for_request`]; stages are checked in
/// this exact order and the first failure wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCheck {
    Ok,
    BalanceExhausted,
    SpendQuotaExceeded,
    Expired,
    ModelNotAllowed,
}

pub struct KeyManager {
    repo: Arc<dyn Repository>,
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl KeyManager {
    /// Load every key from the repository. If the repository holds none,
    /// seed it from `seed` (env/config-provided secrets) so the gateway
    /// never starts with zero keys.
    pub async fn load(repo: Arc<dyn Repository>, seed: &[String]) -> Result<Self> {
        let mut keys = repo.list_keys().await?;
        if keys.is_empty() && !seed.is_empty() {
            for secret in seed {
                let key = ApiKey::new(secret.clone(), "seed");
                repo.insert_key(key.clone()).await?;
                keys.push(key);
            }
        }
        let map = keys.into_iter().map(|k| (k.secret.clone(), k)).collect();
        Ok(Self {
            repo,
            keys: RwLock::new(map),
        })
    }

    /// Atomic snapshot swap from the repository.
    pub async fn reload(&self) -> Result<()> {
        let keys = self.repo.list_keys().await?;
        let map = keys.into_iter().map(|k| (k.secret.clone(), k)).collect();
        *self.keys.write() = map;
        Ok(())
    }

    /// `Validate(secret)`: in-memory lookup followed by a repository check
    /// that the owning user is still active. A repository error here
    /// degrades open (logged) rather than rejecting the request, per the
    /// read-only-check failure policy.
    pub async fn validate(&self, secret: &str) -> KeyActiveCheck {
        let local = {
            let keys = self.keys.read();
            match keys.get(secret) {
                None => return KeyActiveCheck::NotFound,
                Some(k) if !k.active => return KeyActiveCheck::Inactive,
                Some(_) => KeyActiveCheck::Active,
            }
        };
        let result = match self.repo.is_key_active_with_user(secret).await {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(error = %e, "is_key_active_with_user failed, degrading open");
                local
            }
        };
        sa_domain::trace::TraceEvent::KeyValidated {
            key_id: sa_domain::mask_secret(secret),
            outcome: match result {
                KeyActiveCheck::Active => "active",
                KeyActiveCheck::Inactive => "inactive",
                KeyActiveCheck::NotFound => "not_found",
            },
        }
        .emit();
        result
    }

    /// `CheckBalance(secret)`: repository `NotFound` / no owning user is
    /// treated as unmetered and therefore ok.
    pub async fn check_balance_against_repo(&self, secret: &str) -> Result<BalanceCheck> {
        let owner = {
            let keys = self.keys.read();
            keys.get(secret).and_then(|k| k.owner_user_id.clone())
        };
        let Some(owner) = owner else {
            return Ok(BalanceCheck::Ok);
        };
        match self.repo.balance_status(&owner).await {
            Ok(Some(BalanceStatus::Exhausted)) => Ok(BalanceCheck::Exhausted),
            Ok(_) => Ok(BalanceCheck::Ok),
            Err(e) => {
                tracing::warn!(error = %e, "balance_status lookup failed, degrading open");
                Ok(BalanceCheck::Ok)
            }
        }
    }

    pub fn check_spend_quota(&self, secret: &str) -> SpendCheck {
        let keys = self.keys.read();
        match keys.get(secret) {
            Some(k) => match k.spend_limit_usd {
                Some(limit) if k.spend_used_usd >= limit => SpendCheck::Exceeded,
                _ => SpendCheck::Ok,
            },
            None => SpendCheck::Ok,
        }
    }

    pub fn check_expiry(&self, secret: &str) -> ExpiryCheck {
        let keys = self.keys.read();
        match keys.get(secret) {
            Some(k) if k.is_expired(chrono::Utc::now()) => ExpiryCheck::Expired,
            _ => ExpiryCheck::Ok,
        }
    }

    pub fn check_model_access(&self, secret: &str, model: &str) -> ModelCheck {
        let keys = self.keys.read();
        match keys.get(secret) {
            Some(k) if !k.allows_model(model) => ModelCheck::Forbidden,
            _ => ModelCheck::Ok,
        }
    }

    /// `ValidateForRequest(secret, model)`: balance → spend-quota → expiry
    /// → model, in that fixed order. The first failure wins.
    pub async fn validate_for_request(&self, secret: &str, model: &str) -> Result<RequestCheck> {
        if self.check_balance_against_repo(secret).await? == BalanceCheck::Exhausted {
            return Ok(RequestCheck::BalanceExhausted);
        }
        if self.check_spend_quota(secret) == SpendCheck::Exceeded {
            return Ok(RequestCheck::SpendQuotaExceeded);
        }
        if self.check_expiry(secret) == ExpiryCheck::Expired {
            return Ok(RequestCheck::Expired);
        }
        if self.check_model_access(secret, model) == ModelCheck::Forbidden {
            return Ok(RequestCheck::ModelNotAllowed);
        }
        Ok(RequestCheck::Ok)
    }

    /// `IncrementUsage(secret)`: in-memory bump is synchronous, the
    /// repository write is fire-and-forget so the request path never
    /// blocks on it.
    pub fn increment_usage(&self, secret: &str) {
        let now = chrono::Utc::now();
        {
            let mut keys = self.keys.write();
            if let Some(k) = keys.get_mut(secret) {
                k.usage_count += 1;
                k.last_used_at = Some(now);
            }
        }
        let repo = self.repo.clone();
        let secret = secret.to_string();
        tokio::spawn(async move {
            if let Err(e) = repo.increment_key_usage(&secret).await {
                tracing::warn!(error = %e, "failed to persist key usage increment");
            }
        });
    }

    /// Record spend against a key's running total. Same fire-and-forget
    /// discipline as `increment_usage`.
    pub fn increment_spend(&self, secret: &str, delta_usd: f64) {
        {
            let mut keys = self.keys.write();
            if let Some(k) = keys.get_mut(secret) {
                k.spend_used_usd += delta_usd;
            }
        }
        let repo = self.repo.clone();
        let secret = secret.to_string();
        tokio::spawn(async move {
            if let Err(e) = repo.increment_key_spend(&secret, delta_usd).await {
                tracing::warn!(error = %e, "failed to persist key spend increment");
            }
        });
    }

    /// `Add`: write-through. Rejects an empty secret or a duplicate of an
    /// already-known secret, with a distinct `Error` kind for each — this
    /// invariant belongs to the Key Manager, not the storage substitute, so
    /// it holds regardless of which `Repository` impl is behind it.
    pub async fn add(&self, key: ApiKey) -> Result<()> {
        if key.secret.is_empty() {
            return Err(Error::EmptyKey);
        }
        if self.keys.read().contains_key(&key.secret) {
            return Err(Error::DuplicateKey(key.secret.clone()));
        }
        self.repo.insert_key(key.clone()).await?;
        self.keys.write().insert(key.secret.clone(), key);
        Ok(())
    }

    /// `Remove`: soft-delete, write-through before the in-memory flag
    /// flips so the two never disagree after a failure. Rejects removal of
    /// the last remaining *active* key — same reasoning as `add`, this
    /// invariant is enforced here rather than by the repository substitute.
    pub async fn remove(&self, secret: &str) -> Result<()> {
        {
            let keys = self.keys.read();
            match keys.get(secret) {
                None => return Err(Error::NotFound(secret.to_string())),
                Some(k) if k.active && keys.values().filter(|k| k.active).count() <= 1 => {
                    return Err(Error::LastKeyDeletion);
                }
                _ => {}
            }
        }
        self.repo.soft_delete_key(secret).await?;
        if let Some(k) = self.keys.write().get_mut(secret) {
            k.active = false;
        }
        Ok(())
    }

    pub async fn toggle_active(&self, secret: &str, active: bool) -> Result<()> {
        self.repo.toggle_key_active(secret, active).await?;
        if let Some(k) = self.keys.write().get_mut(secret) {
            k.active = active;
        }
        Ok(())
    }

    pub async fn rename(&self, secret: &str, display_name: &str) -> Result<()> {
        self.repo.rename_key(secret, display_name).await?;
        if let Some(k) = self.keys.write().get_mut(secret) {
            k.display_name = display_name.to_string();
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<ApiKey> {
        self.keys.read().values().cloned().collect()
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<ApiKey> {
        self.keys
            .read()
            .values()
            .filter(|k| k.owner_user_id.as_deref() == Some(user_id))
            .cloned()
            .collect()
    }

    pub fn get(&self, secret: &str) -> Option<ApiKey> {
        self.keys.read().get(secret).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceCheck {
    Ok,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendCheck {
    Ok,
    Exceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCheck {
    Ok,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCheck {
    Ok,
    Forbidden,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::repository::InMemoryRepository;

    async fn manager_with(keys: Vec<ApiKey>) -> KeyManager {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        for k in &keys {
            repo.insert_key(k.clone()).await.unwrap();
        }
        KeyManager::load(repo, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn seeds_from_config_when_repo_empty() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let mgr = KeyManager::load(repo, &["sk-seed-123".to_string()]).await.unwrap();
        assert_eq!(mgr.list().len(), 1);
    }

    #[tokio::test]
    async fn validate_unknown_key_is_not_found() {
        let mgr = manager_with(vec![]).await;
        assert_eq!(mgr.validate("sk-missing").await, KeyActiveCheck::NotFound);
    }

    #[tokio::test]
    async fn validate_inactive_key() {
        let mut key = ApiKey::new("sk-1", "k");
        key.active = false;
        let mgr = manager_with(vec![key]).await;
        assert_eq!(mgr.validate("sk-1").await, KeyActiveCheck::Inactive);
    }

    #[tokio::test]
    async fn validate_for_request_checks_spend_before_expiry() {
        let mut key = ApiKey::new("sk-1", "k");
        key.spend_limit_usd = Some(1.0);
        key.spend_used_usd = 2.0;
        key.expires_at = Some(chrono::Utc::now() - chrono::Duration::days(1));
        let mgr = manager_with(vec![key]).await;
        assert_eq!(
            mgr.validate_for_request("sk-1", "gpt-4o").await.unwrap(),
            RequestCheck::SpendQuotaExceeded
        );
    }

    #[tokio::test]
    async fn validate_for_request_model_allowlist_checked_last() {
        let mut key = ApiKey::new("sk-1", "k");
        key.model_allowlist = vec!["claude-3.5-sonnet".into()];
        let mgr = manager_with(vec![key]).await;
        assert_eq!(
            mgr.validate_for_request("sk-1", "gpt-4o").await.unwrap(),
            RequestCheck::ModelNotAllowed
        );
        assert_eq!(
            mgr.validate_for_request("sk-1", "claude-3.5-sonnet")
                .await
                .unwrap(),
            RequestCheck::Ok
        );
    }

    #[tokio::test]
    async fn cannot_add_duplicate_secret() {
        let mgr = manager_with(vec![ApiKey::new("sk-1", "k")]).await;
        let err = mgr.add(ApiKey::new("sk-1", "dup")).await;
        assert!(matches!(err, Err(Error::DuplicateKey(secret)) if secret == "sk-1"));
    }

    #[tokio::test]
    async fn cannot_add_empty_secret() {
        let mgr = manager_with(vec![]).await;
        let err = mgr.add(ApiKey::new("", "empty")).await;
        assert!(matches!(err, Err(Error::EmptyKey)));
    }

    #[tokio::test]
    async fn remove_soft_deletes() {
        let mgr = manager_with(vec![ApiKey::new("sk-1", "k"), ApiKey::new("sk-2", "k2")]).await;
        mgr.remove("sk-1").await.unwrap();
        assert!(!mgr.get("sk-1").unwrap().active);
    }

    #[tokio::test]
    async fn cannot_remove_last_active_key() {
        let mgr = manager_with(vec![ApiKey::new("sk-1", "only")]).await;
        let err = mgr.remove("sk-1").await;
        assert!(matches!(err, Err(Error::LastKeyDeletion)));
    }

    #[tokio::test]
    async fn can_remove_an_already_inactive_key_without_tripping_last_key_guard() {
        let mut inactive = ApiKey::new("sk-1", "k");
        inactive.active = false;
        let mgr = manager_with(vec![inactive, ApiKey::new("sk-2", "k2")]).await;
        mgr.remove("sk-1").await.unwrap();
    }
}
