use std::fmt::{self, Debug};

use supercli_auth::OAuthManager;
use supercli_model::{AuthMode, ProviderProfile};

/// How the provider authenticates its requests.
#[derive(Clone)]
pub enum Authentication {
    /// A static bearer key. Never refreshed.
    ApiKey(String),
    /// A bearer token managed by an [`OAuthManager`].
    OAuth {
        manager: OAuthManager,
        provider: String,
    },
    /// No authentication, e.g. a local server.
    None,
}

impl Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Authentication::OAuth { provider, .. } => f
                .debug_struct("OAuth")
                .field("provider", provider)
                .finish_non_exhaustive(),
            Authentication::None => f.write_str("None"),
        }
    }
}

/// Builder for [`OpenAIConfig`].
#[derive(Clone, Debug)]
pub struct OpenAIConfigBuilder {
    provider_id: String,
    auth: Authentication,
    model: Option<String>,
    base_url: Option<String>,
    models: Vec<String>,
}

impl OpenAIConfigBuilder {
    /// Creates a builder with the given authentication.
    #[inline]
    pub fn with_authentication(auth: Authentication) -> Self {
        Self {
            provider_id: "openai".to_owned(),
            auth,
            model: None,
            base_url: None,
            models: vec![],
        }
    }

    /// Creates a builder with the given API key.
    #[inline]
    pub fn with_api_key<S: Into<String>>(api_key: S) -> Self {
        Self::with_authentication(Authentication::ApiKey(api_key.into()))
    }

    /// Creates a builder from a provider profile. The caller supplies the
    /// authentication matching the profile's auth mode.
    pub fn from_profile(
        profile: &ProviderProfile,
        auth: Authentication,
    ) -> Self {
        debug_assert!(
            matches!(
                (&auth, profile.auth),
                (Authentication::ApiKey(_), AuthMode::ApiKey)
                    | (Authentication::OAuth { .. }, AuthMode::OAuth)
                    | (Authentication::None, AuthMode::None)
            ),
            "authentication does not match the profile"
        );
        let mut builder = Self::with_authentication(auth)
            .with_provider_id(&profile.id)
            .with_base_url(&profile.base_url)
            .with_models(profile.models.clone());
        if let Some(model) = profile.preferred_model() {
            builder = builder.with_model(model);
        }
        builder
    }

    /// Sets the provider id used in logs and error messages.
    #[inline]
    pub fn with_provider_id<S: Into<String>>(mut self, id: S) -> Self {
        self.provider_id = id.into();
        self
    }

    /// Sets the model to use.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets a custom base URL.
    #[inline]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the known model catalog. When empty, the models are fetched
    /// from the server.
    #[inline]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Builds the configuration.
    #[inline]
    pub fn build(self) -> OpenAIConfig {
        let base_url = self
            .base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        OpenAIConfig {
            provider_id: self.provider_id,
            auth: self.auth,
            model: self.model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: base_url.trim_end_matches('/').to_owned(),
            models: self.models,
        }
    }
}

/// Configuration for the OpenAI-compatible provider.
#[derive(Clone, Debug)]
pub struct OpenAIConfig {
    pub(crate) provider_id: String,
    pub(crate) auth: Authentication,
    pub(crate) model: String,
    pub(crate) base_url: String,
    pub(crate) models: Vec<String>,
}

impl OpenAIConfig {
    /// Returns the configured model.
    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub(crate) fn is_local(&self) -> bool {
        matches!(self.auth, Authentication::None)
    }

    #[inline]
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}
