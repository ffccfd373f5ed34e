use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use supercli_core::RetryPolicy;
use supercli_core::tool::{
    Error as ToolError, ErrorKind as ToolErrorKind, ToolResult, ToolSource,
};
use supercli_model::ModelTool;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::client::McpClient;
use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::transport::{Connector, StdioConnector};

/// Separates the server name from the tool name in the names shown to the
/// model, e.g. `github__create_issue`.
const TOOL_SEPARATOR: &str = "__";

/// Liveness of one server connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection broke while in use.
    Failed,
    /// Connecting gave up after the retry budget. Only a manual reconnect
    /// tries again.
    Unavailable,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// A snapshot of one server for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    /// Qualified names of the exposed tools. Empty unless connected.
    pub tools: Vec<String>,
    pub last_error: Option<String>,
}

struct Server {
    config: McpServerConfig,
    state: ConnectionState,
    client: Option<Arc<McpClient>>,
    last_error: Option<String>,
}

/// Owns the MCP server connections and exposes their tools.
///
/// Only connected servers contribute tools. A server whose connection
/// failed keeps its tools hidden until [`reconnect`](Self::reconnect)
/// succeeds.
pub struct McpManager {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    servers: RwLock<BTreeMap<String, Server>>,
}

impl McpManager {
    /// Creates a manager launching servers as child processes.
    pub fn new(configs: impl IntoIterator<Item = McpServerConfig>) -> Self {
        Self::with_connector(configs, StdioConnector::default())
    }

    pub fn with_connector<C: Connector + 'static>(
        configs: impl IntoIterator<Item = McpServerConfig>,
        connector: C,
    ) -> Self {
        let mut servers = BTreeMap::new();
        for config in configs {
            if config.name.contains(TOOL_SEPARATOR) {
                warn!(
                    "MCP server name `{}` contains `{TOOL_SEPARATOR}`, \
                     its tools cannot be called",
                    config.name
                );
            }
            let name = config.name.clone();
            let server = Server {
                config,
                state: ConnectionState::Disconnected,
                client: None,
                last_error: None,
            };
            if servers.insert(name.clone(), server).is_some() {
                warn!("duplicate MCP server `{name}`, the last one wins");
            }
        }
        Self {
            connector: Arc::new(connector),
            retry: RetryPolicy::default(),
            servers: RwLock::new(servers),
        }
    }

    /// Sets the backoff between connection attempts.
    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn state(&self, name: &str) -> Option<ConnectionState> {
        self.servers.read().await.get(name).map(|server| server.state)
    }

    /// Returns the status of every configured server, sorted by name.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let servers = self.servers.read().await;
        servers
            .iter()
            .map(|(name, server)| ServerStatus {
                name: name.clone(),
                state: server.state,
                tools: server
                    .client
                    .as_ref()
                    .map(|client| {
                        client
                            .tools()
                            .iter()
                            .map(|tool| qualify(name, &tool.name))
                            .collect()
                    })
                    .unwrap_or_default(),
                last_error: server.last_error.clone(),
            })
            .collect()
    }

    /// Connects to `name`, retrying with backoff. After the retry budget the
    /// server is marked [`ConnectionState::Unavailable`].
    ///
    /// Connecting a connected server is a no-op, and so is connecting one
    /// that another caller is already connecting.
    pub async fn connect(&self, name: &str) -> Result<(), McpError> {
        let config = {
            let mut servers = self.servers.write().await;
            let server = servers
                .get_mut(name)
                .ok_or_else(|| McpError::UnknownServer(name.to_owned()))?;
            match server.state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    return Ok(());
                }
                _ => {}
            }
            server.state = ConnectionState::Connecting;
            server.last_error = None;
            server.config.clone()
        };

        let mut schedule = self.retry.schedule();
        let result = loop {
            match self.try_connect(&config).await {
                Ok(client) => break Ok(client),
                Err(err) => {
                    warn!(server = %name, "failed to connect: {err}");
                    match schedule.next_delay() {
                        Some(delay) => {
                            debug!(server = %name, "retrying in {delay:?}");
                            sleep(delay).await;
                        }
                        None => {
                            break Err(McpError::Unavailable {
                                server: name.to_owned(),
                                attempts: schedule.failures(),
                                last_error: err.to_string(),
                            });
                        }
                    }
                }
            }
        };

        let mut servers = self.servers.write().await;
        let Some(server) = servers.get_mut(name) else {
            return Err(McpError::UnknownServer(name.to_owned()));
        };
        match result {
            Ok(client) => {
                info!(
                    server = %name,
                    tools = client.tools().len(),
                    protocol = client.protocol_version(),
                    "connected to MCP server"
                );
                server.state = ConnectionState::Connected;
                server.client = Some(Arc::new(client));
                Ok(())
            }
            Err(err) => {
                server.state = ConnectionState::Unavailable;
                server.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Connects every enabled server marked `auto_connect`, concurrently.
    /// Failures are reported per server and do not affect the others.
    pub async fn connect_auto(&self) -> Vec<(String, Result<(), McpError>)> {
        let names: Vec<String> = self
            .servers
            .read()
            .await
            .values()
            .filter(|server| {
                server.config.enabled && server.config.auto_connect
            })
            .map(|server| server.config.name.clone())
            .collect();
        let results =
            join_all(names.iter().map(|name| self.connect(name))).await;
        names.into_iter().zip(results).collect()
    }

    /// Closes the connection to `name`.
    pub async fn disconnect(&self, name: &str) -> Result<(), McpError> {
        let client = {
            let mut servers = self.servers.write().await;
            let server = servers
                .get_mut(name)
                .ok_or_else(|| McpError::UnknownServer(name.to_owned()))?;
            server.state = ConnectionState::Disconnected;
            server.client.take()
        };
        if let Some(client) = client {
            client.close().await;
            info!(server = %name, "disconnected from MCP server");
        }
        Ok(())
    }

    /// Drops the current connection, if any, and connects again.
    pub async fn reconnect(&self, name: &str) -> Result<(), McpError> {
        self.disconnect(name).await?;
        self.connect(name).await
    }

    /// Disconnects every server.
    pub async fn shutdown(&self) {
        let names: Vec<String> =
            self.servers.read().await.keys().cloned().collect();
        for name in names {
            let _ = self.disconnect(&name).await;
        }
    }

    async fn try_connect(
        &self,
        config: &McpServerConfig,
    ) -> Result<McpClient, McpError> {
        let transport = self.connector.connect(config).await?;
        McpClient::initialize(transport).await
    }

    /// Marks the server failed if `client` is still its live connection.
    async fn mark_failed(
        &self,
        name: &str,
        client: &Arc<McpClient>,
        err: &McpError,
    ) {
        let stale = {
            let mut servers = self.servers.write().await;
            let Some(server) = servers.get_mut(name) else {
                return;
            };
            let is_current = server
                .client
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, client));
            if !is_current {
                return;
            }
            warn!(server = %name, "MCP connection failed: {err}");
            server.state = ConnectionState::Failed;
            server.last_error = Some(err.to_string());
            server.client.take()
        };
        if let Some(stale) = stale {
            stale.close().await;
        }
    }
}

#[async_trait]
impl ToolSource for McpManager {
    async fn definitions(&self) -> Vec<ModelTool> {
        let servers = self.servers.read().await;
        servers
            .iter()
            .filter(|(_, server)| server.state == ConnectionState::Connected)
            .filter_map(|(name, server)| Some((name, server.client.as_ref()?)))
            .flat_map(|(name, client)| {
                client.tools().iter().map(move |tool| ModelTool {
                    name: qualify(name, &tool.name),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                })
            })
            .collect()
    }

    async fn call(&self, name: &str, arguments: Value) -> Option<ToolResult> {
        let (server_name, tool) = name.split_once(TOOL_SEPARATOR)?;
        let client = {
            let servers = self.servers.read().await;
            let server = servers.get(server_name)?;
            match (&server.state, &server.client) {
                (ConnectionState::Connected, Some(client)) => {
                    Arc::clone(client)
                }
                (state, _) => {
                    return Some(Err(ToolError::execution_error().with_reason(
                        format!("MCP server `{server_name}` is {state}"),
                    )));
                }
            }
        };
        if !client.tools().iter().any(|info| info.name == tool) {
            return Some(Err(ToolError::new(ToolErrorKind::ToolNotFound)
                .with_reason(format!("`{server_name}` has no tool `{tool}`"))));
        }

        debug!(server = %server_name, tool, "calling MCP tool");
        let result = match client.call_tool(tool, arguments).await {
            Ok(result) if result.is_error => {
                Err(ToolError::execution_error().with_reason(result.text()))
            }
            Ok(result) => Ok(result.text()),
            Err(err) => {
                if err.is_transport() {
                    self.mark_failed(server_name, &client, &err).await;
                }
                let kind = match err {
                    McpError::Timeout { .. } => ToolErrorKind::Timeout,
                    _ => ToolErrorKind::ExecutionError,
                };
                Err(ToolError::new(kind).with_reason(err.to_string()))
            }
        };
        Some(result)
    }
}

fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_SEPARATOR}{tool}")
}
