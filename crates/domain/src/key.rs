use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An inbound API token and the accounting state attached to it.
///
/// See the Key Manager design: secrets are unique, the masked form is a
/// pure function of the secret, and an inactive or expired key never
/// authorises a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub secret: String,
    pub owner_user_id: Option<String>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub spend_limit_usd: Option<f64>,
    pub spend_used_usd: f64,
    pub expires_at: Option<DateTime<Utc>>,
    /// Empty ⇒ all models permitted.
    pub model_allowlist: Vec<String>,
}

impl ApiKey {
    pub fn new(secret: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            owner_user_id: None,
            display_name: display_name.into(),
            created_at: Utc::now(),
            usage_count: 0,
            last_used_at: None,
            active: true,
            spend_limit_usd: None,
            spend_used_usd: 0.0,
            expires_at: None,
            model_allowlist: Vec::new(),
        }
    }

    /// `first4 + '*'*n + last4` — the only representation of the secret
    /// that ever leaves the Key Manager.
    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.model_allowlist.is_empty() || self.model_allowlist.iter().any(|m| m == model)
    }
}

/// Mask a secret as `first4 + '*'*(len-8) + last4`; secrets of length ≤ 8
/// are fully masked. This is the single helper every surface must route
/// through before a token value leaves the core (see credential masking
/// design note).
pub fn mask_secret(secret: &str) -> String {
    let len = secret.len();
    if len <= 8 {
        return "*".repeat(len);
    }
    let first = &secret[..4];
    let last = &secret[len - 4..];
    format!("{first}{}{last}", "*".repeat(len - 8))
}

/// Result of [`crate::repository::Repository::is_key_active_with_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyActiveCheck {
    Active,
    Inactive,
    NotFound,
}

/// Per-user balance status, external to this core but surfaced through the
/// repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceStatus {
    Ok,
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_secret() {
        assert_eq!(mask_secret("sk-abcdefghijklmnop"), "sk-a**************mnop");
    }

    #[test]
    fn masks_short_secret_entirely() {
        assert_eq!(mask_secret("short"), "*****");
    }

    #[test]
    fn mask_is_pure_function_of_secret() {
        let a = ApiKey::new("sk-1234567890abcdef", "a");
        let b = ApiKey::new("sk-1234567890abcdef", "b");
        assert_eq!(a.masked(), b.masked());
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let key = ApiKey::new("sk-anything", "k");
        assert!(key.allows_model("gpt-4o"));
    }

    #[test]
    fn nonempty_allowlist_restricts() {
        let mut key = ApiKey::new("sk-anything", "k");
        key.model_allowlist = vec!["gpt-4o".into()];
        assert!(key.allows_model("gpt-4o"));
        assert!(!key.allows_model("claude-3.5-sonnet"));
    }
}
