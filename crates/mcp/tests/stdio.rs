#![cfg(unix)]

use std::time::Duration;

use serde_json::json;
use supercli_core::RetryPolicy;
use supercli_core::tool::ToolSource;
use supercli_mcp::{
    ConnectionState, McpError, McpManager, McpServerConfig, StdioConnector,
};

/// A line-oriented MCP server in plain `sh`. It answers by request id and
/// ignores notifications, which carry no id.
const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  echo "got request $id" >&2
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"sh-echo","version":"0.1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"Answers pong","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"unknown method"}}\n' "$id" ;;
  esac
done
"#;

fn single_attempt() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        ..Default::default()
    }
}

fn sh_server(name: &str, script: &str) -> McpServerConfig {
    McpServerConfig::new(name, "sh").with_args(["-c", script])
}

#[tokio::test]
async fn test_stdio_server_round_trip() {
    let manager = McpManager::new([sh_server("echo", ECHO_SERVER)]);
    manager.connect("echo").await.unwrap();

    let definitions = manager.definitions().await;
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].name, "echo__ping");
    assert_eq!(definitions[0].description, "Answers pong");

    let result = manager.call("echo__ping", json!({})).await.unwrap();
    assert_eq!(result, Ok("pong".to_owned()));

    manager.shutdown().await;
    assert_eq!(
        manager.state("echo").await,
        Some(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let manager = McpManager::with_connector(
        [sh_server("silent", "cat > /dev/null")],
        StdioConnector::default()
            .with_request_timeout(Duration::from_millis(200)),
    )
    .with_retry_policy(single_attempt());

    let err = manager.connect("silent").await.unwrap_err();
    let McpError::Unavailable { last_error, .. } = err else {
        panic!("expected the server to be unavailable");
    };
    assert!(last_error.contains("initialize"), "{last_error}");
    assert_eq!(
        manager.state("silent").await,
        Some(ConnectionState::Unavailable)
    );
}

#[tokio::test]
async fn test_exiting_server_is_unavailable() {
    let manager = McpManager::new([sh_server("quitter", "exit 0")])
        .with_retry_policy(single_attempt());
    assert!(manager.connect("quitter").await.is_err());
    assert!(manager.definitions().await.is_empty());
}

#[tokio::test]
async fn test_missing_command() {
    let manager = McpManager::new([McpServerConfig::new(
        "ghost",
        "/nonexistent/mcp-server",
    )])
    .with_retry_policy(single_attempt());
    let err = manager.connect("ghost").await.unwrap_err();
    assert!(err.to_string().contains("failed to start"), "{err}");
}
