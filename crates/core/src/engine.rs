mod builder;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use supercli_model::{
    ModelFinishReason, ModelMessage, ModelRequest, TokenUsage, ToolCallRequest,
};
use supercli_session::{Message, Session, SessionStore};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::model_client::{ModelClient, ModelClientResponse};
use crate::tool::{Executor as ToolExecutor, ToolOutcome};
pub use builder::EngineBuilder;

const SUMMARY_INSTRUCTIONS: &str = "You are summarizing a conversation \
between a user and a coding assistant so that it can continue with less \
context. Keep decisions, file names, commands and open questions. Reply with \
the summary only.";

/// The stage an engine is in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// No turn is running.
    #[default]
    Idle,
    /// Waiting for the model to respond.
    AwaitingModel,
    /// Running the tools the model asked for.
    ExecutingTools,
    /// The running turn is being cancelled.
    Cancelled,
}

/// Everything a turn operates on, passed explicitly into every call.
pub struct TurnContext<'a> {
    /// The session the turn appends to.
    pub session: &'a mut Session,
    /// Where to persist the session after the turn, if anywhere.
    pub store: Option<&'a SessionStore>,
    /// Cancels the running turn when fired.
    pub cancel: CancellationToken,
}

impl<'a> TurnContext<'a> {
    /// Creates a context that does not persist the session.
    #[inline]
    pub fn new(session: &'a mut Session) -> Self {
        Self {
            session,
            store: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Persists the session to `store` after each turn.
    #[inline]
    pub fn with_store(mut self, store: &'a SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses `cancel` to interrupt the turn.
    #[inline]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// How a turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TurnEnd {
    /// The model finished its answer.
    Completed,
    /// The answer was cut off by the output token limit.
    Truncated,
    /// The user cancelled the turn.
    Cancelled,
}

/// Summary of a finished turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// How the turn ended.
    pub end: TurnEnd,
    /// The number of tool rounds in the turn.
    pub tool_rounds: usize,
    /// Token usage of all requests in the turn.
    pub usage: TokenUsage,
}

type TranscriptFn = Arc<dyn Fn(&str) + Send + Sync>;
type ToolCallFn = Arc<dyn Fn(&ToolCallRequest) + Send + Sync>;
type ToolResultFn = Arc<dyn Fn(&ToolOutcome) + Send + Sync>;

/// Drives conversation turns: sends the history to the model, runs the
/// tools it asks for and feeds the results back until it answers.
///
/// An engine holds no conversation state itself, the session is passed in
/// with each call. It runs one turn at a time.
pub struct Engine {
    model_client: ModelClient,
    tool_executor: ToolExecutor,
    model: Option<String>,
    system_prompt: Option<String>,
    max_tool_rounds: usize,
    max_consecutive_tool_failures: usize,
    state: watch::Sender<EngineState>,
    on_transcript: Option<TranscriptFn>,
    on_tool_call: Option<ToolCallFn>,
    on_tool_result: Option<ToolResultFn>,
}

impl Engine {
    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state changes.
    #[inline]
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Returns the underlying model client.
    #[inline]
    pub fn model_client(&self) -> &ModelClient {
        &self.model_client
    }

    /// Returns the model requests are sent to, if set.
    #[inline]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Changes the model of subsequent requests.
    #[inline]
    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model;
    }

    /// Runs one user turn to completion.
    ///
    /// The session is saved to the context's store when the turn ends, also
    /// when it fails. Cancellation is not an error: the turn ends with
    /// [`TurnEnd::Cancelled`] and the session stays valid for the next turn.
    pub async fn run_turn(
        &self,
        ctx: &mut TurnContext<'_>,
        input: impl Into<String>,
    ) -> Result<TurnOutcome, EngineError> {
        self.begin()?;
        let input = input.into();
        info!("starting a turn ({} chars)", input.chars().count());
        ctx.session.push(Message::user(input));

        let result = self.drive(ctx).await;
        self.state.send_replace(EngineState::Idle);

        let saved = save(ctx);
        match (result, saved) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), saved) => {
                if let Err(save_err) = saved {
                    warn!("failed to save session: {save_err}");
                }
                Err(err)
            }
        }
    }

    /// Replaces the older part of the history with a model-written summary,
    /// keeping the `keep_recent` newest messages verbatim.
    ///
    /// The session is only modified if the summary was obtained. Returns the
    /// number of summarized messages.
    pub async fn compress(
        &self,
        ctx: &mut TurnContext<'_>,
        keep_recent: usize,
    ) -> Result<usize, EngineError> {
        let split = ctx
            .session
            .compression_point(keep_recent)
            .ok_or(supercli_session::SessionError::NothingToCompress)?;
        self.begin()?;

        let mut messages =
            vec![ModelMessage::System(SUMMARY_INSTRUCTIONS.to_owned())];
        messages.extend(
            ctx.session.messages()[..split]
                .iter()
                .map(Message::to_model_message),
        );
        messages.push(ModelMessage::User(
            "Summarize the conversation so far.".to_owned(),
        ));
        let req = ModelRequest {
            model: self.model.clone(),
            messages,
            tools: vec![],
        };
        let result = self
            .model_client
            .send_request(req, &|_| {}, &ctx.cancel)
            .await;
        self.state.send_replace(EngineState::Idle);

        let resp = result?;
        if resp.finish_reason == ModelFinishReason::Cancelled {
            return Err(EngineError::Cancelled);
        }
        let summary = format!(
            "Summary of the earlier conversation:\n{}",
            resp.transcript.trim()
        );
        let summarized = ctx.session.compress(keep_recent, summary)?;
        if let Some(usage) = resp.usage {
            ctx.session.add_usage(usage);
        }
        info!("compressed {summarized} messages");
        save(ctx)?;
        Ok(summarized)
    }

    fn begin(&self) -> Result<(), EngineError> {
        let mut busy = false;
        self.state.send_if_modified(|state| {
            if *state != EngineState::Idle {
                busy = true;
                return false;
            }
            *state = EngineState::AwaitingModel;
            true
        });
        if busy {
            return Err(EngineError::Busy);
        }
        Ok(())
    }

    async fn drive(
        &self,
        ctx: &mut TurnContext<'_>,
    ) -> Result<TurnOutcome, EngineError> {
        let mut tool_rounds = 0;
        let mut consecutive_failures = 0;
        let mut turn_usage = TokenUsage::default();

        loop {
            self.state.send_replace(EngineState::AwaitingModel);
            let req = self.build_model_request(ctx.session).await;
            let prompt_estimate = estimate_request_tokens(&req);

            let on_transcript = |delta: &str| {
                if let Some(on_transcript) = &self.on_transcript {
                    on_transcript(delta);
                }
            };
            let resp = self
                .model_client
                .send_request(req, &on_transcript, &ctx.cancel)
                .await?;

            let usage = match resp.usage {
                Some(usage) => usage,
                // A request cancelled before it started cost nothing.
                None if resp.finish_reason == ModelFinishReason::Cancelled
                    && resp.transcript.is_empty() =>
                {
                    TokenUsage::default()
                }
                None => TokenUsage {
                    prompt_tokens: prompt_estimate,
                    completion_tokens: estimate_response_tokens(&resp),
                },
            };
            ctx.session.add_usage(usage);
            turn_usage.prompt_tokens += usage.prompt_tokens;
            turn_usage.completion_tokens += usage.completion_tokens;

            let ModelClientResponse {
                transcript,
                tool_calls,
                finish_reason,
                ..
            } = resp;

            let end = match finish_reason {
                ModelFinishReason::Cancelled => {
                    self.state.send_replace(EngineState::Cancelled);
                    if !transcript.is_empty() {
                        ctx.session.push(
                            Message::assistant(transcript)
                                .with_tokens(usage.completion_tokens)
                                .mark_incomplete(),
                        );
                    }
                    info!("turn cancelled while awaiting the model");
                    TurnEnd::Cancelled
                }
                ModelFinishReason::ToolCalls if !tool_calls.is_empty() => {
                    if tool_rounds >= self.max_tool_rounds {
                        warn!("tool loop exceeded after {tool_rounds} rounds");
                        if !transcript.is_empty() {
                            ctx.session.push(
                                Message::assistant(transcript)
                                    .with_tokens(usage.completion_tokens),
                            );
                        }
                        return Err(EngineError::ToolLoopExceeded {
                            rounds: tool_rounds,
                        });
                    }
                    tool_rounds += 1;

                    ctx.session.push(
                        Message::assistant_with_tool_calls(
                            transcript,
                            tool_calls.clone(),
                        )
                        .with_tokens(usage.completion_tokens),
                    );
                    let outcomes =
                        self.run_tools(&tool_calls, &ctx.cancel).await;
                    // One append for the whole batch, so the history never
                    // holds only part of the results.
                    ctx.session.extend(outcomes.iter().map(|outcome| {
                        let (text, is_error) = match &outcome.result {
                            Ok(output) => (output.clone(), false),
                            Err(err) => (err.to_string(), true),
                        };
                        Message::tool_result(&outcome.call_id, text, is_error)
                    }));

                    if ctx.cancel.is_cancelled() {
                        self.state.send_replace(EngineState::Cancelled);
                        info!("turn cancelled while executing tools");
                        TurnEnd::Cancelled
                    } else {
                        for outcome in &outcomes {
                            if outcome.result.is_ok() {
                                consecutive_failures = 0;
                            } else {
                                consecutive_failures += 1;
                            }
                        }
                        let failures = consecutive_failures;
                        if failures >= self.max_consecutive_tool_failures {
                            warn!("{failures} consecutive tool failures");
                            return Err(EngineError::ToolExecutionLimitExceeded {
                                failures,
                            });
                        }
                        continue;
                    }
                }
                reason => {
                    ctx.session.push(
                        Message::assistant(transcript)
                            .with_tokens(usage.completion_tokens),
                    );
                    if reason == ModelFinishReason::Length {
                        TurnEnd::Truncated
                    } else {
                        TurnEnd::Completed
                    }
                }
            };

            return Ok(TurnOutcome {
                end,
                tool_rounds,
                usage: turn_usage,
            });
        }
    }

    async fn run_tools(
        &self,
        tool_calls: &[ToolCallRequest],
        cancel: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        self.state.send_replace(EngineState::ExecutingTools);
        if let Some(on_tool_call) = &self.on_tool_call {
            tool_calls.iter().for_each(|call| on_tool_call(call));
        }
        let outcomes = self.tool_executor.execute_all(tool_calls, cancel).await;
        if let Some(on_tool_result) = &self.on_tool_result {
            outcomes.iter().for_each(|outcome| on_tool_result(outcome));
        }
        outcomes
    }

    async fn build_model_request(&self, session: &Session) -> ModelRequest {
        let mut messages = Vec::with_capacity(session.len() + 1);
        if let Some(system_prompt) = &self.system_prompt {
            messages.push(ModelMessage::System(system_prompt.clone()));
        }
        messages.extend(
            session.messages().iter().map(Message::to_model_message),
        );
        ModelRequest {
            model: self.model.clone(),
            messages,
            tools: self.tool_executor.definitions().await,
        }
    }
}

fn save(ctx: &TurnContext<'_>) -> Result<(), EngineError> {
    if let Some(store) = ctx.store {
        store.save(ctx.session)?;
    }
    Ok(())
}

/// Rough token count used when the provider does not report usage.
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn estimate_request_tokens(req: &ModelRequest) -> u64 {
    req.messages
        .iter()
        .map(|msg| match msg {
            ModelMessage::System(text) | ModelMessage::User(text) => {
                estimate_tokens(text)
            }
            ModelMessage::Assistant(msg) => {
                estimate_tokens(&msg.content)
                    + msg
                        .tool_calls
                        .iter()
                        .map(|call| {
                            estimate_tokens(&call.arguments.to_string())
                        })
                        .sum::<u64>()
            }
            ModelMessage::Tool(result) => estimate_tokens(&result.content),
        })
        .sum()
}

fn estimate_response_tokens(resp: &ModelClientResponse) -> u64 {
    estimate_tokens(&resp.transcript)
        + resp
            .tool_calls
            .iter()
            .map(|call| estimate_tokens(&call.arguments.to_string()))
            .sum::<u64>()
}
