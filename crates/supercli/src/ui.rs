//! Terminal output: a spinner while the model thinks, streamed answers and
//! one line per tool call.

use std::io::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use supercli_core::tool::ToolOutcome;
use supercli_model::ToolCallRequest;

use crate::app::Hooks;

const BAR_CHAR: &str = "▎";
const ARGUMENTS_PREVIEW_CHARS: usize = 80;

#[derive(Default)]
struct State {
    spinner: Option<ProgressBar>,
    /// An answer is being streamed and its line is still open.
    streaming: bool,
}

impl State {
    /// Hides the spinner and ends an open answer line, so that other
    /// output starts on a fresh line.
    fn interrupt(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        if self.streaming {
            println!();
            self.streaming = false;
        }
    }
}

#[derive(Clone, Default)]
pub struct Ui {
    state: Arc<Mutex<State>>,
}

impl Ui {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shows the spinner unless an answer is streaming.
    pub fn start_thinking(&self) {
        let mut state = self.state();
        if state.spinner.is_some() || state.streaming {
            return;
        }
        let style = ProgressStyle::with_template("{spinner} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(style);
        spinner.set_message("🤔 Thinking...");
        state.spinner = Some(spinner);
    }

    pub fn tick(&self) {
        if let Some(spinner) = &self.state().spinner {
            spinner.inc(1);
        }
    }

    /// Prints a piece of the streamed answer.
    pub fn transcript(&self, delta: &str) {
        let mut state = self.state();
        if let Some(spinner) = state.spinner.take() {
            spinner.finish_and_clear();
        }
        if !state.streaming {
            let delta = delta.trim_start();
            if delta.is_empty() {
                return;
            }
            print!("{}🤖 {}", BAR_CHAR.bright_cyan(), delta.bright_white());
            state.streaming = true;
        } else {
            print!("{}", delta.bright_white());
        }
        std::io::stdout().flush().ok();
    }

    pub fn tool_call(&self, call: &ToolCallRequest) {
        let mut state = self.state();
        state.interrupt();
        let arguments = preview(&call.arguments.to_string());
        println!(
            "{}🔧 {} {}",
            BAR_CHAR.bright_yellow(),
            call.name.bright_white().bold(),
            arguments.dimmed()
        );
    }

    pub fn tool_result(&self, outcome: &ToolOutcome) {
        let mut state = self.state();
        state.interrupt();
        match &outcome.result {
            Ok(output) => println!(
                "{}✅ {} {}",
                BAR_CHAR.bright_green(),
                outcome.name,
                preview(output).dimmed()
            ),
            Err(err) => println!(
                "{}❌ {} {}",
                BAR_CHAR.bright_red(),
                outcome.name,
                preview(&err.to_string()).red()
            ),
        }
    }

    /// Closes the output of a turn.
    pub fn end_turn(&self) {
        self.state().interrupt();
    }

    pub fn notice(&self, text: &str) {
        let mut state = self.state();
        state.interrupt();
        println!("{}{}", BAR_CHAR.bright_blue(), text);
    }

    pub fn error(&self, text: &str) {
        let mut state = self.state();
        state.interrupt();
        eprintln!("{}{}", BAR_CHAR.bright_red(), text.red());
    }

    /// Hooks that route app events to this terminal.
    pub fn hooks(&self) -> Hooks {
        let transcript = self.clone();
        let tool_call = self.clone();
        let tool_result = self.clone();
        let notice = self.clone();
        Hooks {
            on_transcript: Some(Arc::new(move |delta: &str| {
                transcript.transcript(delta)
            })),
            on_tool_call: Some(Arc::new(move |call: &ToolCallRequest| {
                tool_call.tool_call(call)
            })),
            on_tool_result: Some(Arc::new(move |outcome: &ToolOutcome| {
                tool_result.tool_result(outcome)
            })),
            on_notice: Some(Arc::new(move |text: &str| notice.notice(text))),
        }
    }
}

/// The first line of `text`, shortened for display.
fn preview(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    let mut out: String = first.chars().take(ARGUMENTS_PREVIEW_CHARS).collect();
    let multiline = text.lines().nth(1).is_some();
    if first.chars().count() > ARGUMENTS_PREVIEW_CHARS || multiline {
        out.push('…');
    }
    out
}
