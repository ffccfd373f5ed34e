//! A model provider for OpenAI-compatible APIs.
//!
//! Most hosted providers (Groq, OpenRouter, Together, Gemini's compatibility
//! endpoint) and local servers such as Ollama speak this protocol. They only
//! differ in how requests are authenticated, see [`Authentication`].

#[macro_use]
extern crate tracing;

mod config;
mod io;
mod proto;
mod response;

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;

use mime::Mime;
use reqwest::{Client, Response, StatusCode, header};
use supercli_auth::AuthError;
use supercli_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest,
};

pub use config::{Authentication, OpenAIConfig, OpenAIConfigBuilder};
use io::{Chunks, Sse};
use proto::ChatCompletionRequest;
pub use response::OpenAIResponse;

/// Error type for [`OpenAIProvider`].
#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    fn from_auth(err: AuthError) -> Self {
        let kind = match &err {
            AuthError::Network(_) => ErrorKind::Network,
            AuthError::CredentialUnavailable { .. }
            | AuthError::NotConfigured(_) => ErrorKind::CredentialUnavailable,
            _ => ErrorKind::Auth,
        };
        Self::new(err.to_string(), kind)
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// OpenAI-compatible model provider.
#[derive(Clone, Debug)]
pub struct OpenAIProvider {
    client: Client,
    config: Arc<OpenAIConfig>,
}

impl OpenAIProvider {
    /// Creates a new `OpenAIProvider` with the given configuration.
    #[inline]
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            client: Client::new(),
            config: Arc::new(config),
        }
    }

    /// Returns the configuration of this provider.
    #[inline]
    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }
}

impl ModelProvider for OpenAIProvider {
    type Error = Error;
    type Response = OpenAIResponse;

    fn authenticate(
        &self,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        async move {
            match &config.auth {
                Authentication::ApiKey(key) => {
                    api_key(key, &config).map(|_| ())
                }
                Authentication::OAuth { manager, provider } => manager
                    .get(provider)
                    .await
                    .map(|_| ())
                    .map_err(Error::from_auth),
                Authentication::None => {
                    let resp = send_checked(
                        client.get(config.endpoint("/models")),
                        &config,
                    )
                    .await?;
                    drop(resp);
                    Ok(())
                }
            }
        }
    }

    fn list_models(
        &self,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'static
    {
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        async move {
            if !config.models.is_empty() {
                return Ok(config.models.clone());
            }
            let token = bearer_token(&config).await?;
            let mut req = client.get(config.endpoint("/models"));
            if let Some(token) = &token {
                req = req.bearer_auth(token);
            }
            let resp = send_checked(req, &config).await?;
            let list: proto::ModelList = resp.json().await.map_err(|err| {
                Error::new(
                    format!("invalid model list: {err}"),
                    ErrorKind::Provider,
                )
            })?;
            Ok(list.data.into_iter().map(|m| m.id).collect())
        }
    }

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let openai_req = proto::create_request(req, &self.config);
        let client = self.client.clone();
        let config = Arc::clone(&self.config);

        async move {
            let token = bearer_token(&config).await?;
            let result =
                post_chat(&client, &config, &openai_req, token.as_deref())
                    .await;
            let resp = match (result, &config.auth) {
                (
                    Err(err),
                    Authentication::OAuth { manager, provider },
                ) if err.kind == ErrorKind::Auth => {
                    // The token was rejected although it looked valid.
                    // Refresh once and retry once; a second rejection is
                    // final for this request.
                    warn!("{provider} rejected the access token, refreshing");
                    let credential = manager
                        .refresh_if_current(
                            provider,
                            token.as_deref().unwrap_or_default(),
                        )
                        .await
                        .map_err(Error::from_auth)?;
                    post_chat(
                        &client,
                        &config,
                        &openai_req,
                        Some(&credential.access_token),
                    )
                    .await?
                }
                (result, _) => result?,
            };

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            let is_event_stream = content_type
                .and_then(|v| v.parse().ok())
                .map(|m: Mime| m.essence_str() == "text/event-stream")
                // Some local servers don't label their streams at all.
                .unwrap_or(content_type.is_none());
            if !is_event_stream {
                return Err(Error::new(
                    format!("unexpected content type: {content_type:?}"),
                    ErrorKind::Provider,
                ));
            }

            // Here we got a successful response.
            let chunks = Chunks::from_response(resp);
            let sse = Sse::new(chunks);
            Ok(OpenAIResponse::from_sse(sse))
        }
    }
}

/// Returns `key` unless it is blank, in which case no request is sent.
fn api_key<'a>(key: &'a str, config: &OpenAIConfig) -> Result<&'a str, Error> {
    if key.trim().is_empty() {
        return Err(Error::new(
            format!("no API key configured for {}", config.provider_id),
            ErrorKind::CredentialUnavailable,
        ));
    }
    Ok(key)
}

async fn bearer_token(config: &OpenAIConfig) -> Result<Option<String>, Error> {
    match &config.auth {
        Authentication::ApiKey(key) => {
            api_key(key, config).map(|key| Some(key.to_owned()))
        }
        Authentication::OAuth { manager, provider } => manager
            .get(provider)
            .await
            .map(|credential| Some(credential.access_token))
            .map_err(Error::from_auth),
        Authentication::None => Ok(None),
    }
}

async fn post_chat(
    client: &Client,
    config: &OpenAIConfig,
    body: &ChatCompletionRequest,
    token: Option<&str>,
) -> Result<Response, Error> {
    let mut req = client
        .post(config.endpoint("/chat/completions"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "text/event-stream")
        .json(body);
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    trace!(provider = %config.provider_id, "posting chat completion");
    send_checked(req, config).await
}

/// Sends the request and maps transport failures and error statuses to
/// error kinds.
async fn send_checked(
    req: reqwest::RequestBuilder,
    config: &OpenAIConfig,
) -> Result<Response, Error> {
    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(err) if err.is_connect() && config.is_local() => {
            return Err(Error::new(
                format!(
                    "{} is not reachable at {}: {err}",
                    config.provider_id, config.base_url
                ),
                ErrorKind::ProviderUnavailable,
            ));
        }
        Err(err) => {
            return Err(Error::new(format!("{err}"), ErrorKind::Network));
        }
    };

    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = proto::error_message(&body).unwrap_or(body);
    let message = format!("{} returned {status}: {detail}", config.provider_id);
    debug!("{message}");
    Err(Error::new(message, status_kind(status)))
}

fn status_kind(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Auth,
        429 => ErrorKind::RateLimitExceeded,
        500..=599 => ErrorKind::Network,
        _ => ErrorKind::Provider,
    }
}
