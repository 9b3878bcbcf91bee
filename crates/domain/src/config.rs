//! Layered configuration: a typed [`Config`] built from defaults, an
//! optional TOML overlay (`SA_CONFIG_PATH`), then the env vars listed below,
//! in that precedence order.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server / CORS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            cors: CorsConfig::default(),
        }
    }
}

fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    /// Literal origins, plus `http://localhost:*`-style wildcard-port
    /// patterns. `*` alone allows any origin (credentials disabled).
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admin
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    /// Bearer token guarding `/api/admin/*`. `None` disables the admin
    /// surface entirely rather than falling open.
    pub admin_key: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting (pipeline stage 1)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_rate_limit_rps")]
    pub requests_per_second: u32,
    #[serde(default = "d_rate_limit_burst")]
    pub burst: u32,
    #[serde(default = "d_rate_limit_idle_secs")]
    pub idle_eviction_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: d_rate_limit_rps(),
            burst: d_rate_limit_burst(),
            idle_eviction_secs: d_rate_limit_idle_secs(),
        }
    }
}

fn d_rate_limit_rps() -> u32 {
    10
}
fn d_rate_limit_burst() -> u32 {
    20
}
fn d_rate_limit_idle_secs() -> u64 {
    300
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Quota manager / session pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "d_low_threshold")]
    pub low_threshold: f64,
    #[serde(default = "d_tie_margin")]
    pub tie_margin: f64,
    #[serde(default = "d_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "d_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    #[serde(default = "d_daily_reset_hour_utc")]
    pub daily_reset_hour_utc: u32,
    #[serde(default = "d_max_failure_count")]
    pub max_failure_count: u32,
    #[serde(default = "d_chars_per_token")]
    pub chars_per_token: f64,
    #[serde(default = "d_token_estimate_multiplier")]
    pub token_estimate_multiplier: f64,
    /// Check the egress IP Cursor sees matches an expected value before
    /// dispatching; empty disables the check.
    #[serde(default)]
    pub session_check_ip: Option<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            low_threshold: d_low_threshold(),
            tie_margin: d_tie_margin(),
            health_check_interval_secs: d_health_check_interval_secs(),
            eviction_interval_secs: d_eviction_interval_secs(),
            daily_reset_hour_utc: d_daily_reset_hour_utc(),
            max_failure_count: d_max_failure_count(),
            chars_per_token: d_chars_per_token(),
            token_estimate_multiplier: d_token_estimate_multiplier(),
            session_check_ip: None,
        }
    }
}

fn d_low_threshold() -> f64 {
    0.8
}
fn d_tie_margin() -> f64 {
    0.05
}
fn d_health_check_interval_secs() -> u64 {
    1800
}
fn d_eviction_interval_secs() -> u64 {
    86_400
}
fn d_daily_reset_hour_utc() -> u32 {
    0
}
fn d_max_failure_count() -> u32 {
    3
}
fn d_chars_per_token() -> f64 {
    4.0
}
fn d_token_estimate_multiplier() -> f64 {
    1.5
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "d_usage_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "d_usage_batch_size")]
    pub batch_size: usize,
    #[serde(default = "d_usage_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "d_usage_retention_days")]
    pub retention_days: i64,
    #[serde(default = "d_usage_cleanup_time")]
    pub cleanup_time_utc: String,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: d_usage_queue_capacity(),
            batch_size: d_usage_batch_size(),
            flush_interval_ms: d_usage_flush_interval_ms(),
            retention_days: d_usage_retention_days(),
            cleanup_time_utc: d_usage_cleanup_time(),
        }
    }
}

fn d_usage_queue_capacity() -> usize {
    1000
}
fn d_usage_batch_size() -> usize {
    100
}
fn d_usage_flush_interval_ms() -> u64 {
    5000
}
fn d_usage_retention_days() -> i64 {
    90
}
fn d_usage_cleanup_time() -> String {
    "03:00".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "d_log_filter")]
    pub filter: String,
    #[serde(default = "d_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: d_log_filter(),
            format: d_log_format(),
        }
    }
}

fn d_log_filter() -> String {
    "info".into()
}
fn d_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env overlay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Apply the documented env var overrides on top of whatever was
    /// loaded from TOML (or the defaults). Env wins.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SA_GATEWAY_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("SA_GATEWAY_PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("ADMIN_KEY") {
            self.admin.admin_key = Some(v);
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_RPS") {
            if let Ok(p) = v.parse() {
                self.rate_limit.requests_per_second = p;
            }
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_BURST") {
            if let Ok(p) = v.parse() {
                self.rate_limit.burst = p;
            }
        }
        if let Ok(v) = std::env::var("QUOTA_LOW_THRESHOLD") {
            if let Ok(p) = v.parse() {
                self.quota.low_threshold = p;
            }
        }
        if let Ok(v) = std::env::var("QUOTA_TIE_MARGIN") {
            if let Ok(p) = v.parse() {
                self.quota.tie_margin = p;
            }
        }
        if let Ok(v) = std::env::var("QUOTA_DAILY_RESET_HOUR_UTC")
            .or_else(|_| std::env::var("QUOTA_RESET_HOUR_UTC"))
        {
            if let Ok(p) = v.parse() {
                self.quota.daily_reset_hour_utc = p;
            }
        }
        if let Ok(v) = std::env::var("QUOTA_MAX_FAILURE_COUNT") {
            if let Ok(p) = v.parse() {
                self.quota.max_failure_count = p;
            }
        }
        if let Ok(v) = std::env::var("SESSION_CHECK_IP") {
            self.quota.session_check_ip = Some(v);
        }
        if let Ok(v) = std::env::var("USAGE_RETENTION_DAYS") {
            if let Ok(p) = v.parse() {
                self.usage.retention_days = p;
            }
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.providers.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            self.providers.anthropic_api_key = Some(v);
        }
        if let Ok(v) =
            std::env::var("GOOGLE_API_KEY").or_else(|_| std::env::var("GOOGLE_AI_API_KEY"))
        {
            self.providers.google_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("DEEPSEEK_API_KEY") {
            self.providers.deepseek_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OPENROUTER_API_KEY") {
            self.providers.openrouter_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("RUST_LOG") {
            self.logging.filter = v;
        }
        if let Ok(v) = std::env::var("SA_LOG_FORMAT") {
            self.logging.format = match v.as_str() {
                "pretty" => LogFormat::Pretty,
                _ => LogFormat::Json,
            };
        }
    }

    /// Load a `Config`: defaults, overlaid by `SA_CONFIG_PATH` TOML if set,
    /// overlaid by env vars.
    pub fn load() -> crate::error::Result<Self> {
        let mut config = match std::env::var("SA_CONFIG_PATH") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)?;
                toml::from_str(&text).map_err(|e| crate::error::Error::Config(e.to_string()))?
            }
            Err(_) => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Validate cross-field invariants not expressible through `serde`
    /// defaults alone. Returns every issue found; the caller decides
    /// whether any [`ConfigSeverity::Error`] should abort startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.admin.admin_key.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "ADMIN_KEY is not set; the admin API is disabled".into(),
            });
        } else if matches!(self.admin.admin_key.as_deref(), Some(k) if k.len() < 16) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "ADMIN_KEY is shorter than 16 characters".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.quota.low_threshold) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "quota.low_threshold must be between 0.0 and 1.0".into(),
            });
        }

        if self.quota.daily_reset_hour_utc > 23 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "quota.daily_reset_hour_utc must be between 0 and 23".into(),
            });
        }

        if self.rate_limit.requests_per_second == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "rate_limit.requests_per_second must be greater than 0".into(),
            });
        }

        if self.rate_limit.burst < self.rate_limit.requests_per_second {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "rate_limit.burst is smaller than requests_per_second".into(),
            });
        }

        if self.usage.batch_size == 0 || self.usage.batch_size > self.usage.queue_capacity {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "usage.batch_size must be nonzero and at most usage.queue_capacity"
                    .into(),
            });
        }

        if self.providers.openai_api_key.is_none()
            && self.providers.anthropic_api_key.is_none()
            && self.providers.google_api_key.is_none()
            && self.providers.deepseek_api_key.is_none()
            && self.providers.openrouter_api_key.is_none()
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "no provider credentials configured; every chat request will fail"
                    .into(),
            });
        }

        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Warning => "warning",
            ConfigSeverity::Error => "error",
        };
        write!(f, "[{tag}] {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_only_warnings() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn bad_threshold_is_an_error() {
        let mut config = Config::default();
        config.quota.low_threshold = 1.5;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn zero_rps_is_an_error() {
        let mut config = Config::default();
        config.rate_limit.requests_per_second = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn batch_larger_than_queue_is_an_error() {
        let mut config = Config::default();
        config.usage.batch_size = config.usage.queue_capacity + 1;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("SA_GATEWAY_PORT", "9999");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.port, 9999);
        std::env::remove_var("SA_GATEWAY_PORT");
    }
}
