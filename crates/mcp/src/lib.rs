//! Connections to MCP (Model Context Protocol) servers.
//!
//! Each configured server runs as a child process speaking JSON-RPC 2.0
//! over its stdio. [`McpManager`] owns the connections and exposes the
//! tools of every connected server to the engine as a
//! [`ToolSource`](supercli_core::tool::ToolSource).

#[macro_use]
extern crate tracing;

mod client;
mod config;
mod error;
mod manager;
mod protocol;
mod transport;

pub use client::McpClient;
pub use config::McpServerConfig;
pub use error::McpError;
pub use manager::{ConnectionState, McpManager, ServerStatus};
pub use protocol::{CallToolResult, ContentBlock, ToolInfo};
pub use transport::{Connector, McpTransport, StdioConnector, StdioTransport};
