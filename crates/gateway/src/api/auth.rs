//! Authentication middleware: two independent surfaces.
//!
//! - `require_admin_key` guards `/api/admin/*` with a single shared secret
//!   (`ADMIN_KEY`), compared as a SHA-256 digest in constant time — the
//!   same shape the teacher used for its own bearer-token gate.
//! - `extract_api_key` only parses `Authorization: Bearer <key>` into a
//!   request extension; it does *not* decide whether the key is valid.
//!   That decision belongs to the Key Manager, which the pipeline
//!   consults as stage 2 so every caller (chat, messages, console) gets
//!   identical error semantics.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Bearer secret pulled off an inbound request by [`extract_api_key`].
#[derive(Debug, Clone)]
pub struct ApiKeySecret(pub String);

/// Require `Authorization: Bearer <key>`, stashing the raw secret as a
/// request extension for downstream handlers. Rejects a missing header or
/// a malformed one outright; an unknown or inactive key is a pipeline
/// stage-2 concern, not this middleware's.
pub async fn extract_api_key(mut req: Request<Body>, next: Next) -> Response {
    let header = req.headers().get(axum::http::header::AUTHORIZATION);
    let header = match header {
        Some(h) => h,
        None => return ApiError::MissingAuth.into_response(),
    };
    let secret = match parse_bearer(header) {
        Some(s) => s,
        None => return ApiError::InvalidAuthFormat.into_response(),
    };
    req.extensions_mut().insert(ApiKeySecret(secret));
    next.run(req).await
}

fn parse_bearer(header: &HeaderValue) -> Option<String> {
    header
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

use axum::response::IntoResponse;

/// Guards `/api/admin/*`: constant-time comparison against the SHA-256
/// digest of `ADMIN_KEY`. Absent `admin_key_hash` disables the admin
/// surface entirely rather than falling open.
pub async fn require_admin_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = &state.admin_key_hash else {
        return ApiError::Internal("admin surface disabled: ADMIN_KEY not configured".into())
            .into_response();
    };

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return ApiError::InvalidApiKey.into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_bearer_header() {
        let header = HeaderValue::from_static("Bearer sk-abc123");
        assert_eq!(parse_bearer(&header).as_deref(), Some("sk-abc123"));
    }

    #[test]
    fn rejects_missing_bearer_prefix() {
        let header = HeaderValue::from_static("sk-abc123");
        assert_eq!(parse_bearer(&header), None);
    }

    #[test]
    fn rejects_empty_token() {
        let header = HeaderValue::from_static("Bearer ");
        assert_eq!(parse_bearer(&header), None);
    }
}
