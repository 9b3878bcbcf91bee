//! Model normalisation and provider routing (pipeline stages 3-4, §4.5).
//!
//! Two static tables, no per-role configuration: callers normalise a
//! client-supplied model id to a canonical name, then resolve that
//! canonical name to a provider. Both tables are intentionally small and
//! explicit rather than pattern-matched — new models are added here.

use sa_domain::error::{Error, Result};

/// Maps provider-specific, often date-stamped, model identifiers to the
/// canonical name this gateway exposes in its own `/v1/models` listing.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-sonnet-4-20250514", "claude-sonnet-4"),
    ("claude-opus-4-20250514", "claude-opus-4"),
    ("claude-3-5-haiku-20241022", "claude-3-5-haiku"),
    ("claude-sonnet-4", "claude-sonnet-4"),
    ("claude-opus-4", "claude-opus-4"),
    ("claude-3-5-haiku", "claude-3-5-haiku"),
    ("gpt-4o", "gpt-4o"),
    ("gpt-4o-mini", "gpt-4o-mini"),
    ("o1", "o1"),
    ("gemini-2.0-flash", "gemini-2.0-flash"),
    ("gemini-1.5-pro", "gemini-1.5-pro"),
    ("deepseek-chat", "deepseek-chat"),
    ("deepseek-reasoner", "deepseek-reasoner"),
    ("cursor-small", "cursor-small"),
    ("cursor-fast", "cursor-fast"),
];

/// Canonical model name → provider name (matching [`crate::registry::ProviderRegistry`] keys).
const PROVIDER_ROUTES: &[(&str, &str)] = &[
    ("claude-sonnet-4", "anthropic"),
    ("claude-opus-4", "anthropic"),
    ("claude-3-5-haiku", "anthropic"),
    ("gpt-4o", "openai"),
    ("gpt-4o-mini", "openai"),
    ("o1", "openai"),
    ("gemini-2.0-flash", "google"),
    ("gemini-1.5-pro", "google"),
    ("deepseek-chat", "deepseek"),
    ("deepseek-reasoner", "deepseek"),
    ("cursor-small", "cursor"),
    ("cursor-fast", "cursor"),
];

/// OpenRouter model ids bypass normalisation entirely: anything under this
/// prefix is routed straight to the `openrouter` provider untouched.
const OPENROUTER_PREFIX: &str = "openrouter/";

/// Stage 3: normalise a client-supplied model id to its canonical form.
///
/// Returns the id itself, unmodified, for OpenRouter-free ids (the
/// model-normalisation bypass). Returns an error for anything else not
/// found in the alias table; the gateway crate maps that to HTTP 400.
pub fn normalize_model(requested: &str) -> Result<String> {
    if requested.starts_with(OPENROUTER_PREFIX) {
        return Ok(requested.to_string());
    }
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == requested)
        .map(|(_, canonical)| canonical.to_string())
        .ok_or_else(|| Error::Other(format!("unknown model '{requested}'")))
}

/// Stage 4: resolve a canonical model id to the provider name that serves
/// it. OpenRouter ids always resolve to `"openrouter"`.
pub fn route_provider(canonical: &str) -> Result<&'static str> {
    if canonical.starts_with(OPENROUTER_PREFIX) {
        return Ok("openrouter");
    }
    PROVIDER_ROUTES
        .iter()
        .find(|(model, _)| *model == canonical)
        .map(|(_, provider)| *provider)
        .ok_or_else(|| Error::Other(format!("no route for model '{canonical}'")))
}

/// Every canonical model id this gateway knows about, for `/v1/models`.
pub fn known_models() -> Vec<&'static str> {
    PROVIDER_ROUTES.iter().map(|(model, _)| *model).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_stamped_claude_id_normalises() {
        assert_eq!(
            normalize_model("claude-sonnet-4-20250514").unwrap(),
            "claude-sonnet-4"
        );
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(normalize_model("llama-70b").is_err());
    }

    #[test]
    fn openrouter_bypasses_normalisation() {
        assert_eq!(
            normalize_model("openrouter/anthropic/claude-3-opus").unwrap(),
            "openrouter/anthropic/claude-3-opus"
        );
    }

    #[test]
    fn canonical_model_routes_to_provider() {
        assert_eq!(route_provider("gpt-4o").unwrap(), "openai");
        assert_eq!(route_provider("claude-sonnet-4").unwrap(), "anthropic");
        assert_eq!(route_provider("cursor-small").unwrap(), "cursor");
    }

    #[test]
    fn openrouter_model_routes_to_openrouter() {
        assert_eq!(
            route_provider("openrouter/anthropic/claude-3-opus").unwrap(),
            "openrouter"
        );
    }

    #[test]
    fn unrouted_model_is_rejected() {
        assert!(route_provider("llama-70b").is_err());
    }
}
