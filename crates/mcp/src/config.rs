use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How to launch one MCP server.
///
/// ```toml
/// [[mcp.servers]]
/// name = "github"
/// command = "npx"
/// args = ["-y", "@modelcontextprotocol/server-github"]
/// env = { GITHUB_TOKEN = "..." }
/// auto_connect = true
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique server id, also the prefix of its tool names.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the server process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Connect at startup instead of waiting for `/mcp connect`.
    #[serde(default)]
    pub auto_connect: bool,
}

impl McpServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: vec![],
            env: BTreeMap::new(),
            enabled: true,
            auto_connect: false,
        }
    }

    #[inline]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[inline]
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }
}

// Environment values often carry tokens.
impl std::fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServerConfig")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("enabled", &self.enabled)
            .field("auto_connect", &self.auto_connect)
            .finish()
    }
}

fn default_true() -> bool {
    true
}
