use std::sync::Arc;
use std::time::Duration;

use supercli_model::{ModelProvider, RateLimits, ToolCallRequest};
use tokio::sync::watch;

use super::{Engine, EngineState};
use crate::model_client::ModelClient;
use crate::retry::RetryPolicy;
use crate::tool::{Executor as ToolExecutor, Tool, ToolOutcome, ToolSource};

const DEFAULT_MAX_TOOL_ROUNDS: usize = 25;
const DEFAULT_MAX_TOOL_FAILURES: usize = 3;

/// [`Engine`] builder.
pub struct EngineBuilder {
    model_client: ModelClient,
    tool_executor: ToolExecutor,
    model: Option<String>,
    system_prompt: Option<String>,
    max_tool_rounds: usize,
    max_consecutive_tool_failures: usize,
    on_transcript: Option<super::TranscriptFn>,
    on_tool_call: Option<super::ToolCallFn>,
    on_tool_result: Option<super::ToolResultFn>,
}

impl EngineBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self::with_model_client(ModelClient::new(provider))
    }

    /// Creates a new builder around an existing model client.
    pub fn with_model_client(model_client: ModelClient) -> Self {
        Self {
            model_client,
            tool_executor: ToolExecutor::default(),
            model: None,
            system_prompt: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            max_consecutive_tool_failures: DEFAULT_MAX_TOOL_FAILURES,
            on_transcript: None,
            on_tool_call: None,
            on_tool_result: None,
        }
    }

    /// Sets the model requests are sent to. Without it the provider picks
    /// its configured model.
    #[inline]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the system prompt sent in front of the history.
    #[inline]
    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Replaces the retry policy of model requests.
    #[inline]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.model_client = self.model_client.with_retry_policy(retry);
        self
    }

    /// Applies client-side request limits.
    #[inline]
    pub fn rate_limits(mut self, limits: RateLimits) -> Self {
        self.model_client = self.model_client.with_rate_limits(limits);
        self
    }

    /// Sets the stream idle timeout.
    #[inline]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.model_client = self.model_client.with_idle_timeout(idle_timeout);
        self
    }

    /// Sets the maximum number of tool rounds in one turn.
    #[inline]
    pub fn max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    /// Sets how many tool calls may fail in a row before the turn is
    /// aborted.
    #[inline]
    pub fn max_consecutive_tool_failures(mut self, failures: usize) -> Self {
        self.max_consecutive_tool_failures = failures.max(1);
        self
    }

    /// Sets the time limit of a single tool call.
    #[inline]
    pub fn tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_executor = self.tool_executor.with_tool_timeout(tool_timeout);
        self
    }

    /// Registers a tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.tool_executor = self.tool_executor.with_tool(tool);
        self
    }

    /// Registers a dynamic tool source, e.g. MCP servers.
    #[inline]
    pub fn with_tool_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.tool_executor = self.tool_executor.with_source(source);
        self
    }

    /// Attaches a callback receiving streamed text.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.on_transcript = Some(Arc::new(on_transcript));
        self
    }

    /// Attaches a callback invoked before tool calls run.
    #[inline]
    pub fn on_tool_call(
        mut self,
        on_tool_call: impl Fn(&ToolCallRequest) + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_call = Some(Arc::new(on_tool_call));
        self
    }

    /// Attaches a callback invoked with each tool result.
    #[inline]
    pub fn on_tool_result(
        mut self,
        on_tool_result: impl Fn(&ToolOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_result = Some(Arc::new(on_tool_result));
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Engine {
        let EngineBuilder {
            model_client,
            tool_executor,
            model,
            system_prompt,
            max_tool_rounds,
            max_consecutive_tool_failures,
            on_transcript,
            on_tool_call,
            on_tool_result,
        } = self;

        let (state, _) = watch::channel(EngineState::Idle);
        Engine {
            model_client,
            tool_executor,
            model,
            system_prompt,
            max_tool_rounds,
            max_consecutive_tool_failures,
            state,
            on_transcript,
            on_tool_call,
            on_tool_result,
        }
    }
}
