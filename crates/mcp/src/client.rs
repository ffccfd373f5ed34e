use serde_json::{Value, json};

use crate::error::McpError;
use crate::protocol::{
    CallToolResult, InitializeResult, ToolInfo, ToolsListResult,
    initialize_params,
};
use crate::transport::McpTransport;

/// An initialized MCP session on top of a transport.
pub struct McpClient {
    transport: Box<dyn McpTransport>,
    info: InitializeResult,
    tools: Vec<ToolInfo>,
}

impl McpClient {
    /// Performs the `initialize` handshake and fetches the tool catalog.
    ///
    /// The transport is closed if any step fails.
    pub async fn initialize(
        transport: Box<dyn McpTransport>,
    ) -> Result<Self, McpError> {
        match handshake(transport.as_ref()).await {
            Ok((info, tools)) => Ok(Self {
                transport,
                info,
                tools,
            }),
            Err(err) => {
                transport.close().await;
                Err(err)
            }
        }
    }

    /// Returns the tools the server advertised when connecting.
    #[inline]
    pub fn tools(&self) -> &[ToolInfo] {
        &self.tools
    }

    #[inline]
    pub fn protocol_version(&self) -> &str {
        &self.info.protocol_version
    }

    /// Returns the name the server reported for itself, if any.
    pub fn server_name(&self) -> Option<&str> {
        self.info
            .server_info
            .as_ref()
            .map(|info| info.name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let arguments = match arguments {
            Value::Null => json!({}),
            arguments => arguments,
        };
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.transport.request("tools/call", params).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

async fn handshake(
    transport: &dyn McpTransport,
) -> Result<(InitializeResult, Vec<ToolInfo>), McpError> {
    let result = transport.request("initialize", initialize_params()).await?;
    let info: InitializeResult = serde_json::from_value(result)?;
    transport
        .notify("notifications/initialized", json!({}))
        .await?;

    let mut tools = vec![];
    let mut cursor: Option<String> = None;
    loop {
        let params = match &cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let result = transport.request("tools/list", params).await?;
        let page: ToolsListResult = serde_json::from_value(result)?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
            _ => break,
        }
    }
    Ok((info, tools))
}
