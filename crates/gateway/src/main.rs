use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use sa_domain::config::{Config, ConfigSeverity};
use sa_domain::repository::{InMemoryRepository, Repository};
use sa_gateway::api;
use sa_gateway::cli::{Cli, Command, ConfigCommand};
use sa_gateway::key_manager::KeyManager;
use sa_gateway::quota::QuotaManager;
use sa_gateway::rate_limit::RateLimiter;
use sa_gateway::scheduler::Scheduler;
use sa_gateway::state::AppState;
use sa_gateway::usage_tracker::UsageTracker;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::SessionPool;
use sha2::{Digest, Sha256};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load().context("loading configuration")?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = Config::load().context("loading configuration")?;
            if !sa_gateway::cli::config::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = Config::load().context("loading configuration")?;
            sa_gateway::cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("serialagent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured tracing, honoring `RUST_LOG`/`SA_LOG_FORMAT` via
/// `Config::apply_env_overrides` (already applied by the time this runs).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sa_gateway=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

/// Parse a comma-separated seed list, e.g. `API_KEYS` or `CURSOR_SESSIONS`.
/// A single-value fallback var (`API_KEY`, `CURSOR_SESSION`) is appended
/// when set, so either form (or both) seeds the repository.
fn seed_list(list_var: &str, single_var: &str) -> Vec<String> {
    let mut seeds: Vec<String> = std::env::var(list_var)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Ok(v) = std::env::var(single_var) {
        if !v.is_empty() {
            seeds.push(v);
        }
    }
    seeds
}

/// Seed the in-memory repository's Cursor sessions from `CURSOR_SESSIONS`/
/// `CURSOR_SESSION`. Each entry is `email:bearer_token`, Pro account type,
/// a default daily limit of 1,000,000 tokens (overridable afterward via
/// the admin API). Only runs when the repository holds no sessions yet.
async fn seed_sessions(repo: &dyn Repository) -> anyhow::Result<()> {
    if !repo.list_sessions().await?.is_empty() {
        return Ok(());
    }
    for entry in seed_list("CURSOR_SESSIONS", "CURSOR_SESSION") {
        let Some((email, token)) = entry.split_once(':') else {
            tracing::warn!(entry = %entry, "skipping malformed CURSOR_SESSIONS entry (want email:token)");
            continue;
        };
        let session = sa_domain::session::CursorSession::new(
            email,
            token,
            sa_domain::session::AccountType::Pro,
            1_000_000,
        );
        repo.insert_session(session).await?;
    }
    Ok(())
}

/// Start the gateway server with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("gateway starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Repository (in-memory; seeded from env on first boot) ────────
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    seed_sessions(repo.as_ref())
        .await
        .context("seeding Cursor sessions")?;

    // ── Key Manager ───────────────────────────────────────────────────
    let key_seed = seed_list("API_KEYS", "API_KEY");
    let keys = Arc::new(
        KeyManager::load(repo.clone(), &key_seed)
            .await
            .context("loading API keys")?,
    );
    tracing::info!(keys = keys.list().len(), "Key Manager ready");

    // ── Session Pool ──────────────────────────────────────────────────
    let has_cursor_sessions = Arc::new(AtomicBool::new(false));
    let sessions = Arc::new(
        SessionPool::load(repo.clone(), has_cursor_sessions.clone())
            .await
            .context("loading Cursor sessions")?,
    );
    tracing::info!(sessions = sessions.list().len(), "Session Pool ready");

    // ── Quota Manager ─────────────────────────────────────────────────
    // `QUOTA_TRACKING_ENABLED=false` bypasses balance-aware selection and
    // falls back to plain round-robin; on by default.
    let quota_enabled = std::env::var("QUOTA_TRACKING_ENABLED")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    let quota = Arc::new(QuotaManager::new(
        sessions.clone(),
        config.quota.clone(),
        quota_enabled,
    ));
    tracing::info!(enabled = quota_enabled, "Quota Manager ready");

    // ── Usage Tracker ─────────────────────────────────────────────────
    let usage = Arc::new(UsageTracker::spawn(repo.clone(), config.usage.clone()));
    tracing::info!("Usage Tracker ready");

    // ── Provider registry ─────────────────────────────────────────────
    let providers = Arc::new(
        ProviderRegistry::from_config(&config.providers, has_cursor_sessions.clone())
            .context("initializing provider registry")?,
    );
    if providers.is_empty() {
        tracing::warn!("no providers initialized — every chat request will fail");
    } else {
        tracing::info!(
            providers = providers.len(),
            list = ?providers.list_providers(),
            "provider registry ready"
        );
    }

    // ── Rate limiter (pipeline stage 1) ───────────────────────────────
    let rate_limiter = RateLimiter::new(config.rate_limit.clone());
    tracing::info!(
        rps = config.rate_limit.requests_per_second,
        burst = config.rate_limit.burst,
        "rate limiter ready"
    );

    // ── Admin key (read once, hash for constant-time comparison) ─────
    let admin_key_hash = match &config.admin.admin_key {
        Some(key) if !key.is_empty() => {
            tracing::info!("admin API enabled");
            Some(Sha256::digest(key.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!("admin API disabled — set ADMIN_KEY to enable");
            None
        }
    };

    // ── Scheduler (health checks, eviction, quota reset, usage cleanup) ─
    let scheduler = Scheduler::start(
        sessions.clone(),
        quota.clone(),
        repo.clone(),
        config.quota.clone(),
        config.usage.clone(),
        reqwest::Client::new(),
    )
    .await;

    // ── App state ──────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        repo,
        keys,
        sessions,
        quota,
        usage,
        providers,
        rate_limiter,
        has_cursor_sessions,
        admin_key_hash,
    };

    // ── CORS + router ───────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors);
    let max_concurrent = std::env::var("SA_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    let app = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "gateway listening");

    let result = axum::serve(listener, app).await.context("axum server error");
    scheduler.stop();
    result
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may contain a trailing `*` wildcard for the port segment
/// (e.g. `http://localhost:*`). These are expanded into a predicate that
/// matches any port on that host.  A literal `"*"` allows all origins
/// (not recommended for production).
fn build_cors_layer(cors: &sa_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    // Special case: if the only entry is "*", use fully permissive CORS.
    // Note: allow_credentials is incompatible with wildcard origins.
    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    // Partition into exact origins and wildcard-port patterns.
    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            // e.g. "http://localhost:*" -> prefix "http://localhost:"
            let prefix = origin.trim_end_matches('*').to_owned();
            wildcard_prefixes.push(prefix);
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            // Check exact matches first.
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            // Check wildcard-port patterns -- validate remainder is digits only
            // to prevent prefix-based bypass (e.g. "http://localhost:3000.evil.com").
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
