use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One completed (or cancelled) call, queued by the pipeline and flushed by
/// the Usage Tracker. Append-only; retained `retention_days` then purged by
/// the Scheduler's usage-cleanup task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub user_id: Option<String>,
    pub key_id: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub upstream_status: u16,
    pub timestamp: DateTime<Utc>,
    pub error_kind: Option<String>,
}

impl UsageRecord {
    pub fn new(key_id: impl Into<String>, model: impl Into<String>, upstream_status: u16) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: None,
            key_id: key_id.into(),
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            upstream_status,
            timestamp: Utc::now(),
            error_kind: None,
        }
    }
}
