use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced while obtaining, refreshing or persisting credentials.
///
/// The type is `Clone` because one refresh result may be delivered to many
/// concurrent waiters.
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    #[error("no usable credential for `{provider}`: {reason}")]
    CredentialUnavailable { provider: String, reason: String },

    #[error("authorization server rejected the request: {reason}")]
    Rejected { reason: String },

    #[error("device authorization expired before it was approved")]
    AuthorizationExpired,

    #[error("OAuth is not configured for provider `{0}`")]
    NotConfigured(String),

    #[error("network error during token exchange: {0}")]
    Network(String),

    #[error("invalid provider id `{0}`")]
    InvalidProvider(String),

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("credential file {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },
}

impl AuthError {
    pub(crate) fn unavailable(
        provider: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CredentialUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Returns `true` if retrying the same exchange can never succeed, which
    /// means the user has to log in again.
    pub fn is_irrecoverable(&self) -> bool {
        matches!(
            self,
            Self::Rejected { .. }
                | Self::AuthorizationExpired
                | Self::CredentialUnavailable { .. }
        )
    }
}
