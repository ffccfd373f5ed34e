use super::CommandError;
use crate::app::App;

pub(super) const USAGE: &str =
    "/mcp [list | connect <name> | disconnect <name> | reconnect <name>]";

pub(super) async fn mcp(app: &App, args: &str) -> Result<String, CommandError> {
    let mut words = args.split_whitespace();
    let action = words.next().unwrap_or("list");
    let name = words.next();
    if words.next().is_some() {
        return Err(CommandError::Usage(USAGE));
    }

    let manager = app.mcp();
    match (action, name) {
        ("list", None) => list(app).await,
        ("connect", Some(name)) => {
            manager.connect(name).await?;
            Ok(format!("Connected to {name}."))
        }
        ("disconnect", Some(name)) => {
            manager.disconnect(name).await?;
            Ok(format!("Disconnected from {name}."))
        }
        ("reconnect", Some(name)) => {
            manager.reconnect(name).await?;
            Ok(format!("Reconnected to {name}."))
        }
        _ => Err(CommandError::Usage(USAGE)),
    }
}

async fn list(app: &App) -> Result<String, CommandError> {
    let servers = app.mcp().status().await;
    if servers.is_empty() {
        return Ok("No MCP servers configured. \
                   Add [[mcp.servers]] entries to config.toml."
            .to_owned());
    }

    let mut out = String::from("MCP servers:");
    for server in servers {
        out.push_str(&format!("\n  {}: {}", server.name, server.state));
        if !server.tools.is_empty() {
            out.push_str(&format!(" ({} tools)", server.tools.len()));
        }
        if let Some(error) = &server.last_error {
            out.push_str(&format!("\n    last error: {error}"));
        }
    }
    Ok(out)
}
