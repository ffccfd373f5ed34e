use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

const DEVICE_CODE_GRANT_TYPE: &str =
    "urn:ietf:params:oauth:grant-type:device_code";

/// OAuth client settings of a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub device_authorization_url: String,
    pub token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Response of the device authorization endpoint (RFC 8628).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub interval: Option<u64>,
}

/// A successful token endpoint response.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// One poll of the device flow token endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenPoll {
    Granted(TokenResponse),
    /// The user has not approved the request yet.
    Pending,
    /// The server asks the client to poll less frequently.
    SlowDown,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl OAuthErrorBody {
    fn reason(&self) -> String {
        match &self.error_description {
            Some(desc) => format!("{}: {desc}", self.error),
            None => self.error.clone(),
        }
    }
}

/// The network side of OAuth, kept behind a trait so the credential
/// lifecycle can be exercised without an authorization server.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn request_device_code(
        &self,
        client: &OAuthClientConfig,
    ) -> Result<DeviceAuthorization, AuthError>;

    async fn poll_device_token(
        &self,
        client: &OAuthClientConfig,
        device_code: &str,
    ) -> Result<TokenPoll, AuthError>;

    async fn refresh(
        &self,
        client: &OAuthClientConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError>;
}

/// [`TokenExchange`] over HTTP form posts.
#[derive(Clone, Debug, Default)]
pub struct HttpTokenExchange {
    http: Client,
}

impl HttpTokenExchange {
    #[inline]
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<(StatusCode, String), AuthError> {
        let resp = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|err| AuthError::Network(err.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|err| AuthError::Network(err.to_string()))?;
        Ok((status, body))
    }
}

fn with_client_fields<'a>(
    client: &'a OAuthClientConfig,
    mut form: Vec<(&'a str, &'a str)>,
) -> Vec<(&'a str, &'a str)> {
    form.push(("client_id", client.client_id.as_str()));
    if let Some(secret) = client.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }
    form
}

fn parse_json<T: for<'de> Deserialize<'de>>(
    body: &str,
) -> Result<T, AuthError> {
    serde_json::from_str(body).map_err(|err| AuthError::Rejected {
        reason: format!("unexpected response from authorization server: {err}"),
    })
}

/// Maps a failed token endpoint response to an error. 5xx responses are
/// transient, everything else is a rejection.
fn token_endpoint_error(status: StatusCode, body: &str) -> AuthError {
    if status.is_server_error() {
        return AuthError::Network(format!("token endpoint returned {status}"));
    }
    let reason = serde_json::from_str::<OAuthErrorBody>(body)
        .map(|body| body.reason())
        .unwrap_or_else(|_| format!("token endpoint returned {status}"));
    AuthError::Rejected { reason }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn request_device_code(
        &self,
        client: &OAuthClientConfig,
    ) -> Result<DeviceAuthorization, AuthError> {
        let mut form = with_client_fields(client, vec![]);
        if let Some(scope) = client.scope.as_deref() {
            form.push(("scope", scope));
        }
        let (status, body) =
            self.post_form(&client.device_authorization_url, &form).await?;
        if !status.is_success() {
            return Err(token_endpoint_error(status, &body));
        }
        parse_json(&body)
    }

    async fn poll_device_token(
        &self,
        client: &OAuthClientConfig,
        device_code: &str,
    ) -> Result<TokenPoll, AuthError> {
        let form = with_client_fields(
            client,
            vec![
                ("grant_type", DEVICE_CODE_GRANT_TYPE),
                ("device_code", device_code),
            ],
        );
        let (status, body) = self.post_form(&client.token_url, &form).await?;
        if status.is_success() {
            return parse_json(&body).map(TokenPoll::Granted);
        }
        if status.is_server_error() {
            return Err(token_endpoint_error(status, &body));
        }
        let error: OAuthErrorBody = parse_json(&body)?;
        match error.error.as_str() {
            "authorization_pending" => Ok(TokenPoll::Pending),
            "slow_down" => Ok(TokenPoll::SlowDown),
            "expired_token" => Err(AuthError::AuthorizationExpired),
            _ => Err(AuthError::Rejected {
                reason: error.reason(),
            }),
        }
    }

    async fn refresh(
        &self,
        client: &OAuthClientConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError> {
        let form = with_client_fields(
            client,
            vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        );
        let (status, body) = self.post_form(&client.token_url, &form).await?;
        if !status.is_success() {
            return Err(token_endpoint_error(status, &body));
        }
        parse_json(&body)
    }
}
