use chrono::Local;
use supercli_session::{
    Content, Role, Session, SessionError, SessionSummary,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::CommandError;
use crate::app::App;

pub(super) const SESSIONS_USAGE: &str =
    "/sessions [list | load <id> | delete <id> | tag <tag> | untag <tag>]";
const PREVIEW_CHARS: usize = 60;

pub(super) fn sessions(
    app: &mut App,
    args: &str,
) -> Result<String, CommandError> {
    let (action, rest) =
        args.split_once(char::is_whitespace).unwrap_or((args, ""));
    let rest = rest.trim();
    match (action, rest) {
        ("" | "list", "") => list(app),
        ("load", id) if !id.is_empty() => load(app, id),
        ("delete", id) if !id.is_empty() => delete(app, id),
        ("tag", tag) if !tag.is_empty() => {
            if !app.session_mut().add_tag(tag) {
                return Ok(format!("The session is already tagged `{tag}`."));
            }
            app.save_session()?;
            Ok(format!("Tagged the session `{tag}`."))
        }
        ("untag", tag) if !tag.is_empty() => {
            if !app.session_mut().remove_tag(tag) {
                return Ok(format!("The session is not tagged `{tag}`."));
            }
            app.save_session()?;
            Ok(format!("Removed the tag `{tag}`."))
        }
        _ => Err(CommandError::Usage(SESSIONS_USAGE)),
    }
}

fn list(app: &App) -> Result<String, CommandError> {
    let summaries = app.sessions().list()?;
    if summaries.is_empty() {
        return Ok("No saved sessions.".to_owned());
    }
    let mut out = String::from("Sessions (newest first):");
    for summary in &summaries {
        let current = if summary.id == app.session().id { "*" } else { " " };
        out.push_str(&format!("\n {current} {}", describe(summary)));
    }
    Ok(out)
}

fn describe(summary: &SessionSummary) -> String {
    let mut line = format!(
        "{}  {}  {} ({} messages)",
        short_id(summary.id),
        summary.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        summary.title.as_deref().unwrap_or("(untitled)"),
        summary.message_count,
    );
    if summary.favorite {
        line.push_str(" ★");
    }
    if !summary.tags.is_empty() {
        let tags: Vec<&str> = summary.tags.iter().map(String::as_str).collect();
        line.push_str(&format!(" [{}]", tags.join(", ")));
    }
    line
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_owned()
}

/// Finds a stored session by its full id or a unique prefix.
fn resolve_id(app: &App, query: &str) -> Result<Uuid, CommandError> {
    if let Ok(id) = Uuid::parse_str(query) {
        return Ok(id);
    }
    let query = query.to_ascii_lowercase().replace('-', "");
    let matches: Vec<Uuid> = app
        .sessions()
        .list()?
        .into_iter()
        .map(|summary| summary.id)
        .filter(|id| id.simple().to_string().starts_with(&query))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(CommandError::Invalid(format!(
            "no session matches `{query}`"
        ))),
        _ => Err(CommandError::Invalid(format!(
            "`{query}` matches {} sessions, type more of the id",
            matches.len()
        ))),
    }
}

fn load(app: &mut App, query: &str) -> Result<String, CommandError> {
    let id = resolve_id(app, query)?;
    if !app.session().is_empty() {
        app.save_session()?;
    }
    let session = app.sessions().load(id)?;
    let count = session.len();
    app.replace_session(session);
    Ok(format!("Loaded session {} ({count} messages).", short_id(id)))
}

fn delete(app: &mut App, query: &str) -> Result<String, CommandError> {
    let id = resolve_id(app, query)?;
    if id == app.session().id {
        return Err(CommandError::Invalid(
            "cannot delete the current session, start a /new one first"
                .to_owned(),
        ));
    }
    if !app.sessions().delete(id)? {
        return Ok(format!("Session {} does not exist.", short_id(id)));
    }
    Ok(format!("Deleted session {}.", short_id(id)))
}

pub(super) fn new(app: &mut App) -> Result<String, CommandError> {
    if !app.session().is_empty() {
        app.save_session()?;
    }
    app.replace_session(Session::new());
    Ok("Started a new session.".to_owned())
}

pub(super) fn rewind(
    app: &mut App,
    args: &str,
) -> Result<String, CommandError> {
    if args.is_empty() {
        return Ok(history(app.session()));
    }
    let index: usize = args
        .parse()
        .map_err(|_| CommandError::Usage("/rewind [index]"))?;
    let len = app.session().len();
    if index >= len {
        return Err(SessionError::IndexOutOfRange { index, len }.into());
    }
    let removed = app.session_mut().rewind(index);
    if removed == 0 {
        return Ok("Nothing to remove.".to_owned());
    }
    app.save_session()?;
    Ok(format!(
        "Removed {removed} messages, {} left.",
        app.session().len()
    ))
}

fn history(session: &Session) -> String {
    if session.is_empty() {
        return "The session is empty.".to_owned();
    }
    let mut out = String::from("Messages:");
    for (index, message) in session.messages().iter().enumerate() {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        };
        let text = match &message.content {
            Content::ToolCalls { text, calls } if text.trim().is_empty() => {
                let names: Vec<&str> =
                    calls.iter().map(|c| c.name.as_str()).collect();
                format!("calls {}", names.join(", "))
            }
            _ => message.text().to_owned(),
        };
        out.push_str(&format!("\n  {index:>3}  {role:<9}  {}", preview(&text)));
    }
    out
}

fn preview(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let mut preview: String = line.chars().take(PREVIEW_CHARS).collect();
    let multiline = text.trim().lines().count() > 1;
    if line.chars().count() > PREVIEW_CHARS || multiline {
        preview.push_str("...");
    }
    preview
}

pub(super) async fn compress(
    app: &mut App,
    args: &str,
    cancel: &CancellationToken,
) -> Result<String, CommandError> {
    let keep_recent = match args {
        "" => None,
        keep => Some(
            keep.parse()
                .map_err(|_| CommandError::Usage("/compress [keep]"))?,
        ),
    };
    let summarized = app.compress(keep_recent, cancel.clone()).await?;
    Ok(format!(
        "Summarized {summarized} messages, {} left.",
        app.session().len()
    ))
}

pub(super) fn favorite(
    app: &mut App,
    args: &str,
) -> Result<String, CommandError> {
    let favorite = match args {
        "" => !app.session().metadata.favorite,
        "on" => true,
        "off" => false,
        _ => return Err(CommandError::Usage("/favorite [on | off]")),
    };
    app.session_mut().set_favorite(favorite);
    app.save_session()?;
    Ok(if favorite {
        "Marked the session as favorite.".to_owned()
    } else {
        "Removed the session from favorites.".to_owned()
    })
}
