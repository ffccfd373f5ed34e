//! Slash commands.
//!
//! [`dispatch`] only splits the command word from its arguments, every
//! command has its own handler returning the reply to show.

mod auth;
mod mcp;
mod model;
mod session;

use supercli_auth::AuthError;
use supercli_core::{EngineError, ModelError};
use supercli_mcp::McpError;
use supercli_session::SessionError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::app::{App, AppError};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command `/{0}`, try /help")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Mcp(#[from] McpError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Reply(String),
    Quit,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub help: &'static str,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "login",
        usage: "/login [provider]",
        help: "Log in to an OAuth provider with a device code.",
    },
    CommandSpec {
        name: "logout",
        usage: "/logout [provider]",
        help: "Forget the stored login or API key of a provider.",
    },
    CommandSpec {
        name: "key",
        usage: "/key [provider] <api key>",
        help: "Store an API key. Without arguments, show which keys are set.",
    },
    CommandSpec {
        name: "model",
        usage: "/model [list [provider] | <model> | <provider>[/<model>]]",
        help: "Show, list or switch the provider and model.",
    },
    CommandSpec {
        name: "mcp",
        usage: mcp::USAGE,
        help: "Manage MCP server connections.",
    },
    CommandSpec {
        name: "sessions",
        usage: session::SESSIONS_USAGE,
        help: "Browse and manage saved sessions.",
    },
    CommandSpec {
        name: "new",
        usage: "/new",
        help: "Start a new session.",
    },
    CommandSpec {
        name: "rewind",
        usage: "/rewind [index]",
        help: "Drop messages after `index`. Without it, list the messages.",
    },
    CommandSpec {
        name: "compress",
        usage: "/compress [keep]",
        help: "Summarize older messages, keeping the newest `keep`.",
    },
    CommandSpec {
        name: "favorite",
        usage: "/favorite [on | off]",
        help: "Mark the current session as favorite, or toggle it.",
    },
    CommandSpec {
        name: "help",
        usage: "/help",
        help: "Show this help.",
    },
    CommandSpec {
        name: "quit",
        usage: "/quit",
        help: "Exit.",
    },
];

#[inline]
pub fn is_command(line: &str) -> bool {
    line.trim_start().starts_with('/')
}

/// Splits `/name args` into the lowercase command word and the trimmed
/// rest.
fn split(line: &str) -> (String, &str) {
    let line = line.trim().trim_start_matches('/');
    let (name, args) =
        line.split_once(char::is_whitespace).unwrap_or((line, ""));
    (name.to_ascii_lowercase(), args.trim())
}

/// Runs the command in `line`.
///
/// `cancel` interrupts long running commands such as `/login` and
/// `/compress`.
pub async fn dispatch(
    app: &mut App,
    line: &str,
    cancel: &CancellationToken,
) -> Result<CommandOutcome, CommandError> {
    let (name, args) = split(line);
    debug!("command /{name}");
    let reply = match name.as_str() {
        "login" => auth::login(app, args, cancel).await?,
        "logout" => auth::logout(app, args).await?,
        "key" => auth::key(app, args)?,
        "model" => model::model(app, args).await?,
        "mcp" => mcp::mcp(app, args).await?,
        "sessions" => session::sessions(app, args)?,
        "new" => session::new(app)?,
        "rewind" => session::rewind(app, args)?,
        "compress" => session::compress(app, args, cancel).await?,
        "favorite" => session::favorite(app, args)?,
        "help" => help(),
        "quit" | "exit" => return Ok(CommandOutcome::Quit),
        _ => return Err(CommandError::Unknown(name)),
    };
    Ok(CommandOutcome::Reply(reply))
}

fn help() -> String {
    let width = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    let mut out = String::from("Commands:");
    for command in COMMANDS {
        let CommandSpec { usage, help, .. } = command;
        out.push_str(&format!("\n  {usage:width$}  {help}"));
    }
    out
}

/// Returns the provider named in `args`, or the current one.
fn provider_arg<'a>(
    app: &'a App,
    args: &'a str,
) -> Result<&'a str, CommandError> {
    let provider = match args.split_whitespace().next() {
        Some(provider) => provider,
        None => app.provider(),
    };
    if !app.catalog().contains_key(provider) {
        return Err(AppError::UnknownProvider(provider.to_owned()).into());
    }
    Ok(provider)
}
