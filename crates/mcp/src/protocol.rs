//! JSON-RPC 2.0 framing and the MCP messages the client needs.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub(crate) const PROTOCOL_VERSION: &str = "2024-11-05";
const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    jsonrpc: &'static str,
    id: i64,
    method: &'a str,
    params: Value,
}

impl<'a> Request<'a> {
    pub fn new(id: i64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Anything the server writes. Requests and notifications from the server
/// carry a `method`; responses carry `result` or `error`.
#[derive(Debug, Deserialize)]
pub(crate) struct Incoming {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Incoming {
    /// Returns the numeric id if this is a response to one of our requests.
    pub fn response_id(&self) -> Option<i64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_i64)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub(crate) struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "supercli",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// A tool advertised by a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object" })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolsListResult {
    pub tools: Vec<ToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One block of tool output.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mimeType", default)]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unknown,
}

/// The result of `tools/call`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Renders the content as text for the model. Non-text blocks become
    /// short placeholders.
    pub fn text(&self) -> String {
        let parts: Vec<String> = self
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.clone(),
                ContentBlock::Image { mime_type } => {
                    format!("[image: {mime_type}]")
                }
                ContentBlock::Resource { resource } => resource
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| resource.to_string()),
                ContentBlock::Unknown => "[unsupported content]".to_owned(),
            })
            .collect();
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_classification() {
        let resp: Incoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"result":{}}"#,
        )
        .unwrap();
        assert_eq!(resp.response_id(), Some(3));

        let req: Incoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"roots/list"}"#,
        )
        .unwrap();
        assert_eq!(req.response_id(), None);

        let err: Incoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        assert_eq!(err.response_id(), Some(4));
        assert_eq!(err.error.unwrap().code, -32601);
    }

    #[test]
    fn test_call_result_text() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[
                {"type":"text","text":"line 1"},
                {"type":"image","data":"...","mimeType":"image/png"},
                {"type":"audio","data":"..."}
            ],"isError":true}"#,
        )
        .unwrap();
        assert!(result.is_error);
        assert_eq!(
            result.text(),
            "line 1\n[image: image/png]\n[unsupported content]"
        );
    }

    #[test]
    fn test_tool_info_defaults() {
        let info: ToolInfo =
            serde_json::from_str(r#"{"name":"search"}"#).unwrap();
        assert_eq!(info.input_schema, json!({ "type": "object" }));
        assert!(info.description.is_empty());
    }
}
