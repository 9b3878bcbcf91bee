use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Default fraction of `daily_limit` at which a session's status degrades
/// from `available` to `low`.
pub const DEFAULT_LOW_THRESHOLD: f64 = 0.8;

/// Process-wide monotonic counter handing out each [`CursorSession`] its
/// insertion sequence, since email order is not insertion order and
/// `Vec::sort` would otherwise have no stable tie-break to fall back on.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A single Cursor account's credentials plus its daily-quota bookkeeping.
///
/// Identity is the login email; the bearer token is the secret. See the
/// Session Pool design for the health state machine and round-robin
/// selection this type participates in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorSession {
    pub email: String,
    pub bearer_token: String,
    #[serde(default)]
    pub extra_cookies: Vec<String>,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub valid: bool,
    pub failure_count: u32,
    pub usage_count: u64,
    pub daily_limit: u64,
    pub tokens_consumed_today: u64,
    pub last_reset_date: NaiveDate,
    pub account_type: AccountType,
    /// Insertion order, for round-robin tie-breaking (§4.2). Not a wire
    /// concern — always assigned locally, never trusted from the wire.
    #[serde(default = "next_sequence")]
    pub sequence: u64,
}

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Free,
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Available,
    Low,
    Exhausted,
}

impl CursorSession {
    pub fn new(
        email: impl Into<String>,
        bearer_token: impl Into<String>,
        account_type: AccountType,
        daily_limit: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            email: email.into(),
            bearer_token: bearer_token.into(),
            extra_cookies: Vec::new(),
            user_agent: "Mozilla/5.0 (compatible; gateway/1.0)".into(),
            created_at: now,
            expires_at: None,
            last_used_at: None,
            last_checked_at: None,
            valid: true,
            failure_count: 0,
            usage_count: 0,
            daily_limit,
            tokens_consumed_today: 0,
            last_reset_date: now.date_naive(),
            account_type,
            sequence: next_sequence(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e < now)
    }

    /// Recompute [`QuotaStatus`] from `tokens_consumed_today` against
    /// `daily_limit` at the configured low-quota threshold.
    pub fn quota_status(&self, low_threshold: f64) -> QuotaStatus {
        if self.daily_limit == 0 || self.tokens_consumed_today >= self.daily_limit {
            return QuotaStatus::Exhausted;
        }
        let fraction = self.tokens_consumed_today as f64 / self.daily_limit as f64;
        if fraction >= low_threshold {
            QuotaStatus::Low
        } else {
            QuotaStatus::Available
        }
    }

    pub fn remaining(&self) -> u64 {
        self.daily_limit.saturating_sub(self.tokens_consumed_today)
    }

    pub fn remaining_fraction(&self) -> f64 {
        if self.daily_limit == 0 {
            0.0
        } else {
            self.remaining() as f64 / self.daily_limit as f64
        }
    }

    /// `email`, `bearer_token` masked, `extra_cookies` cleared. Full
    /// secrets never leave the Session Pool.
    pub fn masked(&self) -> CursorSession {
        let mut copy = self.clone();
        copy.bearer_token = mask_session_token(&self.bearer_token);
        copy.extra_cookies.clear();
        copy
    }
}

/// `first8 + '*'*(len-12) + last4`; for lengths ≤ 12 the whole value is
/// stars.
pub fn mask_session_token(token: &str) -> String {
    let len = token.len();
    if len <= 12 {
        return "*".repeat(len);
    }
    let first = &token[..8];
    let last = &token[len - 4..];
    format!("{first}{}{last}", "*".repeat(len - 12))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(consumed: u64, limit: u64) -> CursorSession {
        let mut s = CursorSession::new("a@example.com", "tok", AccountType::Free, limit);
        s.tokens_consumed_today = consumed;
        s
    }

    #[test]
    fn status_available_below_threshold() {
        assert_eq!(
            session_with(100, 1000).quota_status(DEFAULT_LOW_THRESHOLD),
            QuotaStatus::Available
        );
    }

    #[test]
    fn status_low_at_threshold() {
        assert_eq!(
            session_with(800, 1000).quota_status(DEFAULT_LOW_THRESHOLD),
            QuotaStatus::Low
        );
    }

    #[test]
    fn status_exhausted_at_limit() {
        assert_eq!(
            session_with(1000, 1000).quota_status(DEFAULT_LOW_THRESHOLD),
            QuotaStatus::Exhausted
        );
    }

    #[test]
    fn mask_short_token_is_stars() {
        assert_eq!(mask_session_token("short"), "*****");
    }

    #[test]
    fn mask_long_token() {
        let masked = mask_session_token("abcdefghijklmnopqrstuvwxyz");
        assert!(masked.starts_with("abcdefgh"));
        assert!(masked.ends_with("wxyz"));
        assert!(!masked.contains("ijklmnop"));
    }

    #[test]
    fn masked_clears_cookies() {
        let mut s = CursorSession::new("a@example.com", "abcdefghijklmnop", AccountType::Pro, 1000);
        s.extra_cookies = vec!["sid=1".into()];
        let masked = s.masked();
        assert!(masked.extra_cookies.is_empty());
        assert_ne!(masked.bearer_token, s.bearer_token);
    }
}
