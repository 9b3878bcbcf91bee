//! Provider registry.
//!
//! Constructs and holds every upstream adapter. At startup the registry
//! reads provider credentials from [`sa_domain::config::ProvidersConfig`]
//! and instantiates whichever adapters have the env var they need; a
//! missing credential skips that adapter rather than aborting startup
//! (`IsAvailable()` is then permanently false for it).

use crate::anthropic::AnthropicProvider;
use crate::cursor::CursorProvider;
use crate::google::GoogleProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::ProviderClient;
use sa_domain::config::ProvidersConfig;
use sa_domain::error::Result;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Records a provider that failed to initialize, with its secrets masked.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub name: String,
    pub error: String,
}

/// Mask substrings that look like API keys or bearer tokens in an error
/// message before it reaches logs or a readiness endpoint.
fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = if trimmed.len() > 8 {
                format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..])
            } else {
                "***masked***".to_string()
            };
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
    init_errors: Vec<ProviderInitError>,
}

impl ProviderRegistry {
    /// Build the registry. `has_cursor_sessions` is shared with the Session
    /// Pool / Scheduler and flipped whenever the pool gains or loses its
    /// last valid session, so the Cursor adapter's `is_available()` stays
    /// accurate without polling.
    pub fn from_config(
        config: &ProvidersConfig,
        has_cursor_sessions: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
        let mut init_errors = Vec::new();

        let mut register = |name: &str, result: Result<Arc<dyn ProviderClient>>| match result {
            Ok(p) => {
                tracing::info!(provider = name, "registered provider");
                providers.insert(name.to_string(), p);
            }
            Err(e) => {
                let error = mask_secrets(&e.to_string());
                tracing::warn!(provider = name, %error, "provider unavailable, skipping");
                init_errors.push(ProviderInitError {
                    name: name.to_string(),
                    error,
                });
            }
        };

        if let Some(key) = config.openai_api_key.clone() {
            let models = vec!["gpt-4o".into(), "gpt-4o-mini".into(), "o1".into()];
            register(
                "openai",
                OpenAiCompatProvider::new("openai", "https://api.openai.com/v1", key, models)
                    .map(|p| Arc::new(p) as Arc<dyn ProviderClient>),
            );
        }

        if let Some(key) = config.anthropic_api_key.clone() {
            let models = vec![
                "claude-sonnet-4-20250514".into(),
                "claude-opus-4-20250514".into(),
                "claude-3-5-haiku-20241022".into(),
            ];
            register(
                "anthropic",
                AnthropicProvider::new(key, models).map(|p| Arc::new(p) as Arc<dyn ProviderClient>),
            );
        }

        if let Some(key) = config.google_api_key.clone() {
            let models = vec!["gemini-2.0-flash".into(), "gemini-1.5-pro".into()];
            register(
                "google",
                GoogleProvider::new(key, models).map(|p| Arc::new(p) as Arc<dyn ProviderClient>),
            );
        }

        if let Some(key) = config.deepseek_api_key.clone() {
            let models = vec!["deepseek-chat".into(), "deepseek-reasoner".into()];
            register(
                "deepseek",
                OpenAiCompatProvider::new("deepseek", "https://api.deepseek.com/v1", key, models)
                    .map(|p| Arc::new(p) as Arc<dyn ProviderClient>),
            );
        }

        if let Some(key) = config.openrouter_api_key.clone() {
            let models = vec!["openrouter/auto".into()];
            register(
                "openrouter",
                OpenAiCompatProvider::new(
                    "openrouter",
                    "https://openrouter.ai/api/v1",
                    key,
                    models,
                )
                .map(|p| Arc::new(p) as Arc<dyn ProviderClient>),
            );
        }

        // Cursor has no API key of its own; availability tracks the Session
        // Pool instead, so it is always registered.
        register(
            "cursor",
            CursorProvider::new(vec!["cursor-small".into(), "cursor-fast".into()], has_cursor_sessions)
                .map(|p| Arc::new(p) as Arc<dyn ProviderClient>),
        );

        Ok(Self {
            providers,
            init_errors,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn ProviderClient>)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_secrets_redacts_long_tokens() {
        let msg = "failed with key sk-abcdefghijklmnopqrstuvwx rejected";
        let masked = mask_secrets(msg);
        assert!(!masked.contains("abcdefghijklmnopqrstuvwx"));
        assert!(masked.contains("sk-a"));
    }

    #[test]
    fn cursor_is_always_registered() {
        let config = ProvidersConfig::default();
        let registry =
            ProviderRegistry::from_config(&config, Arc::new(AtomicBool::new(false))).unwrap();
        assert!(registry.get("cursor").is_some());
        assert!(registry.get("openai").is_none());
    }
}
