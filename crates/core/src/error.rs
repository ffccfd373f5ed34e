use std::fmt::{self, Display};

use supercli_model::{ErrorKind, ModelProviderError};
use supercli_session::SessionError;
use thiserror::Error;

/// A failed model request, after retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelError {
    kind: ErrorKind,
    message: String,
}

impl ModelError {
    /// Creates a new error.
    #[inline]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error message reported by the provider.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_provider(err: &dyn ModelProviderError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ModelError {}

/// Errors that abort a conversation turn.
///
/// The session keeps every message appended before the failure.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model request failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The model kept requesting tools beyond the round limit.
    #[error("tool loop exceeded after {rounds} rounds")]
    ToolLoopExceeded {
        /// Completed tool rounds.
        rounds: usize,
    },

    /// Too many tool calls failed in a row.
    #[error("{failures} consecutive tool calls failed")]
    ToolExecutionLimitExceeded {
        /// Consecutive failures observed.
        failures: usize,
    },

    /// Reading or writing the session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The operation was cancelled before it produced a result.
    #[error("cancelled")]
    Cancelled,

    /// A turn is already running on this engine.
    #[error("engine is busy")]
    Busy,
}

impl EngineError {
    /// Returns `true` if the user has to log in (again) to continue.
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            EngineError::Model(err) if matches!(
                err.kind(),
                ErrorKind::Auth | ErrorKind::CredentialUnavailable
            )
        )
    }
}
