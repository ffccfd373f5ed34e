use serde::{Deserialize, Serialize};

/// How requests to a provider are authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMode {
    /// A static API key sent as a bearer token.
    #[serde(rename = "api_key")]
    ApiKey,
    /// A bearer token obtained and refreshed through OAuth.
    #[serde(rename = "oauth")]
    OAuth,
    /// No authentication, usually a local server.
    #[serde(rename = "none")]
    None,
}

/// Client-side request limits for a provider.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct RateLimits {
    /// Maximum requests per rolling minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    /// Maximum requests per rolling day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u32>,
}

/// Static description of a provider, loaded once at startup.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Unique provider id, e.g. `groq`.
    pub id: String,
    /// The authentication mode.
    pub auth: AuthMode,
    /// Base URL of the OpenAI-compatible endpoint.
    pub base_url: String,
    /// Known models of this provider.
    #[serde(default)]
    pub models: Vec<String>,
    /// The model used when none is selected explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Environment variable holding the API key, for key-based providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Request limits.
    #[serde(default)]
    pub rate_limits: RateLimits,
}

impl ProviderProfile {
    /// Returns `true` if the provider runs locally without authentication.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.auth == AuthMode::None
    }

    /// Returns the model to use when the caller has no preference.
    pub fn preferred_model(&self) -> Option<&str> {
        self.default_model
            .as_deref()
            .or_else(|| self.models.first().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_profile() {
        let profile: ProviderProfile = serde_json::from_str(
            r#"{
                "id": "ollama",
                "auth": "none",
                "base_url": "http://localhost:11434/v1",
                "models": ["llama3.2", "qwen2.5"]
            }"#,
        )
        .unwrap();
        assert!(profile.is_local());
        assert_eq!(profile.preferred_model(), Some("llama3.2"));
        assert_eq!(profile.rate_limits, RateLimits::default());
    }
}
