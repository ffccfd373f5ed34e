use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The session file exists but cannot be parsed. The file is left as is.
    #[error("session file {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("session {0} does not exist")]
    NotFound(Uuid),

    #[error("message index {index} is out of range (session has {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("not enough history to compress")]
    NothingToCompress,

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
