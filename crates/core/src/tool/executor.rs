use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use supercli_model::{ModelTool, ToolCallRequest};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::tool::{AnyTool, Error, ErrorKind, Tool, ToolObject, ToolResult};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// A dynamic set of tools living outside the process, such as the tools of
/// MCP servers.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// Returns the tools that are currently available.
    async fn definitions(&self) -> Vec<ModelTool>;

    /// Calls the tool `name`. Returns `None` if this source does not provide
    /// such a tool.
    async fn call(&self, name: &str, arguments: Value) -> Option<ToolResult>;
}

/// The result of one tool call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutcome {
    /// The id of the call this outcome answers.
    pub call_id: String,
    /// The name of the called tool.
    pub name: String,
    /// The tool output or the error.
    pub result: ToolResult,
}

/// An executor that handles tool call requests from the model.
///
/// Built-in tools take precedence over tools of the same name provided by a
/// [`ToolSource`].
#[derive(Clone)]
pub struct Executor {
    tools: HashMap<String, Arc<dyn ToolObject>>,
    sources: Vec<Arc<dyn ToolSource>>,
    tool_timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            tools: HashMap::new(),
            sources: vec![],
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

impl Executor {
    /// Registers a built-in tool.
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.tools
            .insert(tool.name().to_owned(), Arc::new(AnyTool(tool)));
        self
    }

    /// Registers a dynamic tool source.
    #[inline]
    pub fn with_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Sets the time limit of a single tool call.
    #[inline]
    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    /// Returns the definitions of all available tools, sorted by name.
    pub async fn definitions(&self) -> Vec<ModelTool> {
        let mut definitions: Vec<ModelTool> =
            self.tools.values().map(|tool| tool.definition()).collect();
        let mut seen: HashSet<String> =
            self.tools.keys().cloned().collect();
        for source in &self.sources {
            for definition in source.definitions().await {
                if seen.insert(definition.name.clone()) {
                    definitions.push(definition);
                }
            }
        }
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Executes a single call.
    pub async fn execute(&self, call: &ToolCallRequest) -> ToolResult {
        let run = async {
            if let Some(tool) = self.tools.get(&call.name) {
                trace!(
                    "spawning a tool ({}) with args: {:?}",
                    call.id, call.arguments
                );
                return tool.execute(call.arguments.clone()).await;
            }
            for source in &self.sources {
                if let Some(result) =
                    source.call(&call.name, call.arguments.clone()).await
                {
                    return result;
                }
            }
            warn!("tool not found: {}", call.name);
            Err(Error::new(ErrorKind::ToolNotFound)
                .with_reason(format!("no tool named `{}`", call.name)))
        };
        match timeout(self.tool_timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout().with_reason(format!(
                "tool did not finish within {}s",
                self.tool_timeout.as_secs()
            ))),
        }
    }

    /// Executes all calls concurrently and returns their outcomes in the
    /// order of `calls`, regardless of completion order.
    ///
    /// Calls still running when `cancel` fires finish with a `Cancelled`
    /// error, calls that already completed keep their result.
    pub async fn execute_all(
        &self,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        let futs = calls.iter().map(|call| {
            async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::cancelled()),
                    result = self.execute(call) => result,
                };
                if let Err(err) = &result {
                    debug!("tool {} failed: {err}", call.name);
                }
                ToolOutcome {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    result,
                }
            }
            .instrument(debug_span!(
                "tool execute",
                id = %call.id,
                name = %call.name
            ))
        });
        join_all(futs).await
    }
}
