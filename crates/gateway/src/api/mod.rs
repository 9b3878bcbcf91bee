pub mod admin;
pub mod auth;
pub mod chat;
pub mod console;
pub mod error;
pub mod messages;
pub mod models;

use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router: public health/readiness, the upstream-
/// compatible inference surface (OpenAI + Anthropic dialects, keyed
/// auth), the operator console (keyed auth), and the admin CRUD surface
/// (separate `ADMIN_KEY` auth).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/v1/health", get(health))
        .route("/api/models/marketplace", get(models::marketplace));

    let inference = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/messages", post(messages::messages))
        .route(
            "/api/chat/conversations/:id/messages",
            post(console::post_message),
        )
        .route_layer(middleware::from_fn(auth::extract_api_key));

    let admin = Router::new()
        .route("/api/admin/keys", get(admin::list_keys))
        .route("/api/admin/keys", post(admin::create_key))
        .route("/api/admin/keys/:id", patch(admin::update_key))
        .route("/api/admin/keys/:id", delete(admin::delete_key))
        .route("/api/admin/sessions", get(admin::list_sessions))
        .route("/api/admin/sessions", post(admin::create_session))
        .route("/api/admin/sessions/:email", delete(admin::delete_session))
        .route(
            "/api/admin/sessions/:email/quota",
            patch(admin::update_session_quota),
        )
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_admin_key,
        ));

    public
        .merge(inference)
        .merge(admin)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}
