//! `ApiError` (§7): the eleven error rows the pipeline can surface to a
//! client, each with its HTTP status and a stable `type` string for the
//! `{error:{message,type,code}}` response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub enum ApiError {
    MissingAuth,
    InvalidAuthFormat,
    InvalidApiKey,
    TokenExpired,
    BalanceExhausted,
    TokenQuotaExceeded,
    ModelNotAllowed,
    UnknownModel(String),
    RateLimited,
    ProviderNotAvailable(String),
    ProviderError { kind: ProviderErrorKind, message: String },
    ContextTooLong(String),
    Internal(String),
}

/// The upstream provider error taxonomy (§4.4/§7): a typed enum rather
/// than string prefixes, so the pipeline can key off a kind instead of
/// matching on message text. `Display` renders the contractual prefix for
/// callers that still want it as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    InvalidApiKey,
    RateLimited,
    ProviderError,
    BadRequest,
    UnknownError,
}

impl ProviderErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::InvalidApiKey => "INVALID_API_KEY",
            ProviderErrorKind::RateLimited => "RATE_LIMITED",
            ProviderErrorKind::ProviderError => "PROVIDER_ERROR",
            ProviderErrorKind::BadRequest => "BAD_REQUEST",
            ProviderErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "missing_auth",
                "Authorization header is missing".into(),
            ),
            ApiError::InvalidAuthFormat => (
                StatusCode::UNAUTHORIZED,
                "invalid_auth_format",
                "Authorization header must be 'Bearer <key>'".into(),
            ),
            ApiError::InvalidApiKey => (
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                "API key is unknown, inactive, or disabled".into(),
            ),
            ApiError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "token_expired",
                "API key has expired".into(),
            ),
            ApiError::BalanceExhausted => (
                StatusCode::PAYMENT_REQUIRED,
                "balance_exhausted",
                "Account balance is exhausted".into(),
            ),
            ApiError::TokenQuotaExceeded => (
                StatusCode::PAYMENT_REQUIRED,
                "token_quota_exceeded",
                "Key spend quota exceeded".into(),
            ),
            ApiError::ModelNotAllowed => (
                StatusCode::FORBIDDEN,
                "model_not_allowed",
                "Model is outside this key's allowlist".into(),
            ),
            ApiError::UnknownModel(model) => (
                StatusCode::BAD_REQUEST,
                "unknown_model",
                format!("'{model}' is not a recognised model id"),
            ),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Rate limit exceeded".into(),
            ),
            ApiError::ProviderNotAvailable(msg) => {
                (StatusCode::BAD_GATEWAY, "PROVIDER_NOT_AVAILABLE", msg.clone())
            }
            ApiError::ProviderError { kind, message } => (StatusCode::BAD_GATEWAY, kind.as_str(), message.clone()),
            ApiError::ContextTooLong(msg) => {
                (StatusCode::BAD_REQUEST, "CONTEXT_TOO_LONG", msg.clone())
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg.clone()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = self.parts();
        let body = ErrorBody {
            error: ErrorDetail {
                message,
                kind,
                code: status.as_u16(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Classify an upstream HTTP status + body snippet per the provider error
/// taxonomy (§4.4): 401→INVALID_API_KEY, 429→RATE_LIMITED, 5xx→PROVIDER_ERROR,
/// a 4xx body mentioning context/token/maximum/length→CONTEXT_TOO_LONG,
/// any other 4xx→BAD_REQUEST, everything else→UNKNOWN_ERROR.
pub fn classify_provider_error(status: u16, body: &str) -> ApiError {
    let lower = body.to_lowercase();
    match status {
        401 | 403 => ApiError::ProviderError {
            kind: ProviderErrorKind::InvalidApiKey,
            message: format!("upstream rejected credentials ({status})"),
        },
        429 => ApiError::ProviderError {
            kind: ProviderErrorKind::RateLimited,
            message: format!("upstream rate-limited us ({status})"),
        },
        500..=599 => ApiError::ProviderError {
            kind: ProviderErrorKind::ProviderError,
            message: format!("upstream server error ({status})"),
        },
        400..=499
            if lower.contains("context")
                || lower.contains("token")
                || lower.contains("maximum")
                || lower.contains("length") =>
        {
            ApiError::ContextTooLong(body.to_string())
        }
        400..=499 => ApiError::ProviderError {
            kind: ProviderErrorKind::BadRequest,
            message: format!("upstream bad request ({status}): {body}"),
        },
        _ => ApiError::ProviderError {
            kind: ProviderErrorKind::UnknownError,
            message: format!("unexpected upstream status {status}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_length_body_maps_to_context_too_long() {
        let err = classify_provider_error(400, "maximum context length exceeded");
        assert!(matches!(err, ApiError::ContextTooLong(_)));
    }

    #[test]
    fn server_error_maps_to_provider_error() {
        let err = classify_provider_error(503, "service unavailable");
        assert!(matches!(
            err,
            ApiError::ProviderError { kind: ProviderErrorKind::ProviderError, .. }
        ));
    }

    #[test]
    fn unauthorized_maps_to_invalid_api_key_kind_with_contractual_prefix() {
        let err = classify_provider_error(401, "unauthorized");
        assert!(matches!(
            err,
            ApiError::ProviderError { kind: ProviderErrorKind::InvalidApiKey, .. }
        ));
        assert_eq!(err.parts().1, "INVALID_API_KEY");
    }

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(ApiError::MissingAuth.parts().0, StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::BalanceExhausted.parts().0, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(ApiError::ModelNotAllowed.parts().0, StatusCode::FORBIDDEN);
        assert_eq!(ApiError::UnknownModel(String::new()).parts().0, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::RateLimited.parts().0, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::ProviderNotAvailable(String::new()).parts().0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::ContextTooLong(String::new()).parts().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Internal(String::new()).parts().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
