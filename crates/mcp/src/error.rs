use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error talking to the server: {0}")]
    Io(#[from] io::Error),
    #[error("`{method}` timed out after {}s", timeout.as_secs())]
    Timeout { method: String, timeout: Duration },
    #[error("the server closed the connection")]
    Closed,
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("unknown MCP server `{0}`")]
    UnknownServer(String),
    #[error("MCP server `{0}` is not connected")]
    NotConnected(String),
    #[error(
        "MCP server `{server}` is unavailable after {attempts} attempts: \
         {last_error}"
    )]
    Unavailable {
        server: String,
        attempts: u32,
        last_error: String,
    },
}

impl McpError {
    /// Returns `true` if the connection can no longer be used.
    #[inline]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McpError::Io(_) | McpError::Timeout { .. } | McpError::Closed
        )
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Protocol(err.to_string())
    }
}
