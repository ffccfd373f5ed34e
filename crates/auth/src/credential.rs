use std::fmt::{self, Debug};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exchange::TokenResponse;

/// Access token lifetime assumed when the server omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_S: i64 = 3600;

/// An OAuth credential for one provider.
///
/// The serialized form is the credential file layout:
/// `{ "access_token", "refresh_token"?, "expiry", "scope"? }`, where `expiry`
/// is in unix seconds. The provider id is not part of the file; it is given
/// by the file name.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(skip)]
    pub provider: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expiry: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Credential {
    /// Builds a credential from a token endpoint response.
    ///
    /// Servers may omit the refresh token on refresh; the one from
    /// `previous` is carried over in that case.
    pub fn from_token_response(
        provider: &str,
        token: TokenResponse,
        previous: Option<&Credential>,
        now: i64,
    ) -> Self {
        let lifetime = token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_S);
        Self {
            provider: provider.to_owned(),
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            expiry: now.saturating_add(lifetime),
            scope: token
                .scope
                .or_else(|| previous.and_then(|p| p.scope.clone())),
        }
    }

    /// Returns `true` if the credential expires within `margin` from `now`.
    #[inline]
    pub fn needs_refresh(&self, now: i64, margin: Duration) -> bool {
        self.expiry <= now.saturating_add(margin.as_secs() as i64)
    }

    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry <= now
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expiry", &self.expiry)
            .field("scope", &self.scope)
            .finish()
    }
}
