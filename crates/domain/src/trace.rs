use serde::Serialize;

/// Structured trace events emitted across the gateway's request and
/// background-task paths. Each is logged as a single JSON-encoded `tracing`
/// field so the event stream can be grepped or shipped without a schema.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    KeyValidated {
        key_id: String,
        outcome: &'static str,
    },
    SessionSelected {
        email: String,
        partition: &'static str,
        remaining_fraction: f64,
    },
    SessionHealthTransition {
        email: String,
        previous_valid: bool,
        valid: bool,
        failure_count: u32,
        cause: &'static str,
    },
    SessionQuotaReset {
        email: String,
    },
    SessionEvicted {
        email: String,
        expiry: String,
    },
    UsageTracked {
        email: String,
        delta_tokens: u32,
        status: &'static str,
    },
    UsageRecordEnqueued {
        request_id: String,
        status_code: u16,
    },
    UsageRecordDropped {
        request_id: String,
    },
    ProviderRequest {
        provider: String,
        model: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    SchedulerTick {
        task: &'static str,
        affected: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "gateway_event");
    }
}
