//! Shared utility functions for provider adapters.

use sa_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve an upstream API key from the named environment variable.
///
/// Every adapter is seeded from a single env var at registry construction
/// time (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, ...); there is no keychain
/// or plaintext-config path.
pub fn resolve_api_key_env(var_name: &str) -> Result<String> {
    std::env::var(var_name).map_err(|_| {
        Error::Auth(format!(
            "environment variable '{var_name}' not set or not valid UTF-8"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_api_key_env_present() {
        let var_name = "SA_TEST_RESOLVE_ENV_KEY_1234";
        std::env::set_var(var_name, "env-secret-value");
        let result = resolve_api_key_env(var_name).unwrap();
        assert_eq!(result, "env-secret-value");
        std::env::remove_var(var_name);
    }

    #[test]
    fn resolve_api_key_env_missing() {
        let err = resolve_api_key_env("SA_TEST_NONEXISTENT_VAR_8888").unwrap_err();
        assert!(err.to_string().contains("SA_TEST_NONEXISTENT_VAR_8888"));
    }
}
