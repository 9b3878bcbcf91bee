//! Admin CRUD (§6) for the two in-core entities the rest of the gateway
//! owns: API Keys (Key Manager) and Cursor Sessions (Session Pool). Every
//! handler here is mounted behind [`crate::api::auth::require_admin_key`].
//! User-account administration stays out of scope.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct KeySummary {
    pub secret_masked: String,
    pub display_name: String,
    pub active: bool,
    pub usage_count: u64,
    pub spend_used_usd: f64,
    pub spend_limit_usd: Option<f64>,
    pub model_allowlist: Vec<String>,
}

impl From<sa_domain::key::ApiKey> for KeySummary {
    fn from(k: sa_domain::key::ApiKey) -> Self {
        Self {
            secret_masked: k.masked(),
            display_name: k.display_name,
            active: k.active,
            usage_count: k.usage_count,
            spend_used_usd: k.spend_used_usd,
            spend_limit_usd: k.spend_limit_usd,
            model_allowlist: k.model_allowlist,
        }
    }
}

pub async fn list_keys(State(state): State<AppState>) -> Json<Vec<KeySummary>> {
    Json(state.keys.list().into_iter().map(KeySummary::from).collect())
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub secret: String,
    pub display_name: String,
}

pub async fn create_key(
    State(state): State<AppState>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Json<KeySummary>, ApiError> {
    let key = sa_domain::key::ApiKey::new(req.secret, req.display_name);
    state
        .keys
        .add(key.clone())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(KeySummary::from(key)))
}

#[derive(Deserialize)]
pub struct UpdateKeyRequest {
    pub active: Option<bool>,
    pub display_name: Option<String>,
}

pub async fn update_key(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    Json(req): Json<UpdateKeyRequest>,
) -> Result<Json<KeySummary>, ApiError> {
    if let Some(active) = req.active {
        state
            .keys
            .toggle_active(&secret, active)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }
    if let Some(name) = req.display_name {
        state
            .keys
            .rename(&secret, &name)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }
    state
        .keys
        .get(&secret)
        .map(|k| Json(KeySummary::from(k)))
        .ok_or_else(|| ApiError::Internal("key not found after update".into()))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(secret): Path<String>,
) -> Result<Response, ApiError> {
    state
        .keys
        .remove(&secret)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}

#[derive(Serialize)]
pub struct SessionSummary {
    pub email: String,
    pub bearer_token_masked: String,
    pub valid: bool,
    pub daily_limit: u64,
    pub tokens_consumed_today: u64,
    pub account_type: sa_domain::session::AccountType,
}

impl From<sa_domain::session::CursorSession> for SessionSummary {
    fn from(s: sa_domain::session::CursorSession) -> Self {
        Self {
            email: s.email,
            bearer_token_masked: sa_domain::session::mask_session_token(&s.bearer_token),
            valid: s.valid,
            daily_limit: s.daily_limit,
            tokens_consumed_today: s.tokens_consumed_today,
            account_type: s.account_type,
        }
    }
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(
        state
            .sessions
            .list_active_raw()
            .into_iter()
            .map(SessionSummary::from)
            .collect(),
    )
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub email: String,
    pub bearer_token: String,
    pub account_type: sa_domain::session::AccountType,
    pub daily_limit: u64,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Json<SessionSummary> {
    let session = sa_domain::session::CursorSession::new(
        req.email,
        req.bearer_token,
        req.account_type,
        req.daily_limit,
    );
    // Fire-and-forget write-through, matching every other Session Pool
    // mutator (see `SessionPool::add`).
    state.sessions.add(session.clone());
    Json(SessionSummary::from(session))
}

pub async fn delete_session(State(state): State<AppState>, Path(email): Path<String>) -> Response {
    state.sessions.remove(&email);
    axum::http::StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
pub struct UpdateSessionQuotaRequest {
    pub daily_limit: u64,
}

pub async fn update_session_quota(
    State(state): State<AppState>,
    Path(email): Path<String>,
    Json(req): Json<UpdateSessionQuotaRequest>,
) -> Result<Response, ApiError> {
    state
        .quota
        .update_session_quota(&email, req.daily_limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}
