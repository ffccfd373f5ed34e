#[macro_use]
extern crate tracing;

use std::future::Future;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use supercli::commands::{self, CommandOutcome};
use supercli::config::{Config, Paths};
use supercli::ui::Ui;
use supercli::{App, AppError, AppOptions, Resume};
use supercli_core::TurnEnd;
use tokio::io::{self, AsyncBufReadExt};
use tokio::select;
use tokio::signal;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// An interactive coding agent for OpenAI-compatible providers.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Provider to start with, e.g. `groq` or `ollama`.
    #[arg(long)]
    provider: Option<String>,

    /// Model to start with. Defaults to the provider's default model.
    #[arg(long)]
    model: Option<String>,

    /// Directory the file and command tools work in.
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Resume the session with this id.
    #[arg(long, value_name = "ID", conflicts_with = "continue_latest")]
    resume: Option<Uuid>,

    /// Resume the most recently used session.
    #[arg(short = 'c', long = "continue")]
    continue_latest: bool,

    /// Read the configuration from this file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    let mut paths = Paths::discover()?;
    if let Some(config_file) = args.config {
        paths.config_file = config_file;
    }
    let config = Config::load(&paths.config_file)?;

    let workdir = match args.workdir {
        Some(workdir) => workdir,
        None => std::env::current_dir().map_err(|source| AppError::Workspace {
            path: PathBuf::from("."),
            source,
        })?,
    };
    let resume = match (args.resume, args.continue_latest) {
        (Some(id), _) => Resume::Id(id),
        (None, true) => Resume::Latest,
        (None, false) => Resume::New,
    };
    let options = AppOptions {
        provider: args.provider,
        model: args.model,
        workdir,
        resume,
    };

    let ui = Ui::new();
    let mut app = App::new(config, &paths, options, ui.hooks())?;
    ui.notice(&format!(
        "Using {}/{} in {}. Type /help for commands.",
        app.provider(),
        app.model(),
        app.workspace().root().display()
    ));
    if !app.session().is_empty() {
        ui.notice(&format!(
            "Resumed session {} with {} messages.",
            app.session().id,
            app.session().len()
        ));
    }

    tokio::spawn({
        let mcp = app.mcp().clone();
        let ui = ui.clone();
        async move {
            for (name, result) in mcp.connect_auto().await {
                match result {
                    Ok(()) => info!(server = %name, "MCP server connected"),
                    Err(err) => ui.error(&format!("MCP server {name}: {err}")),
                }
            }
        }
    });

    repl(&mut app, &ui).await;
    app.shutdown().await;
    Ok(())
}

async fn repl(app: &mut App, ui: &Ui) {
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let line = select! {
            line = read_line() => line,
            _ = signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        if commands::is_command(line) {
            let dispatch = commands::dispatch(app, line, &cancel);
            match interruptible(ui, &cancel, dispatch, false).await {
                Ok(CommandOutcome::Reply(reply)) => println!("{reply}"),
                Ok(CommandOutcome::Quit) => break,
                Err(err) => ui.error(&err.to_string()),
            }
            continue;
        }

        let turn = app.run_turn(line, cancel.clone());
        let result = interruptible(ui, &cancel, turn, true).await;
        ui.end_turn();
        match result {
            Ok(outcome) => match outcome.end {
                TurnEnd::Completed => {}
                TurnEnd::Truncated => ui.notice(
                    "The answer was cut off by the output token limit.",
                ),
                TurnEnd::Cancelled => ui.notice("Cancelled."),
            },
            Err(err) => {
                ui.error(&err.to_string());
                if err.needs_login() {
                    let provider = app.provider();
                    ui.notice(&format!(
                        "Log in with /login {provider} \
                         or set a key with /key {provider} <key>."
                    ));
                }
            }
        }
    }
}

/// Drives `task` to completion. The first Ctrl-C cancels `cancel`, the
/// task is still awaited so that it can save what it has.
async fn interruptible<F: Future>(
    ui: &Ui,
    cancel: &CancellationToken,
    task: F,
    spinner: bool,
) -> F::Output {
    tokio::pin!(task);
    loop {
        if spinner {
            ui.start_thinking();
            ui.tick();
        }
        select! {
            output = &mut task => return output,
            _ = signal::ctrl_c(), if !cancel.is_cancelled() => {
                debug!("interrupted");
                cancel.cancel();
            }
            _ = sleep(Duration::from_millis(100)) => {}
        }
    }
}

async fn read_line() -> Option<String> {
    let mut stdin = io::BufReader::new(io::stdin());
    let mut line = String::new();

    match stdin.read_line(&mut line).await {
        Ok(count) => {
            if count == 0 {
                return None;
            }
            Some(line)
        }
        Err(err) => {
            error!("error reading input: {}", err);
            None
        }
    }
}
