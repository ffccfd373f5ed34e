use std::fmt::{self, Display};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The provider rejected the credentials (e.g. HTTP 401/403).
    Auth,
    /// The model provider is rate limited.
    RateLimitExceeded,
    /// A transient transport failure (connect/read errors, 5xx responses).
    Network,
    /// The provider endpoint cannot be reached at all. Typically reported by
    /// local providers that are not running.
    ProviderUnavailable,
    /// No usable credential could be obtained for the provider.
    CredentialUnavailable,
    /// A non-retryable error reported by the provider (other 4xx responses,
    /// malformed payloads, etc.).
    Provider,
    /// The content is moderated.
    Moderated,
    /// Any other errors.
    Other,
}

impl ErrorKind {
    /// Returns `true` if a request failing with this kind may succeed when
    /// retried later.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RateLimitExceeded | ErrorKind::Network)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Auth => "authentication failed",
            ErrorKind::RateLimitExceeded => "rate limit exceeded",
            ErrorKind::Network => "network error",
            ErrorKind::ProviderUnavailable => "provider unavailable",
            ErrorKind::CredentialUnavailable => "credential unavailable",
            ErrorKind::Provider => "provider error",
            ErrorKind::Moderated => "content moderated",
            ErrorKind::Other => "other error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::RateLimitExceeded.is_transient());
        assert!(ErrorKind::Network.is_transient());
        assert!(!ErrorKind::Auth.is_transient());
        assert!(!ErrorKind::Provider.is_transient());
        assert!(!ErrorKind::ProviderUnavailable.is_transient());
    }
}
