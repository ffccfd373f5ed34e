use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;
use serde_json::{Map, Value};
use supercli_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
    TokenUsage, ToolCallRequest,
};

use crate::Error;
use crate::io::Sse;
use crate::proto::{ChatCompletionChunk, ToolCall};

struct PartialState {
    sse: Sse,
    id: Option<String>,
    // Tool call deltas are merged here by index, and only emitted once the
    // model has finished so that every emitted call is complete.
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<ModelFinishReason>,
    usage: Option<TokenUsage>,
    pending_events: VecDeque<ModelResponseEvent>,
    done: bool,
}

impl PartialState {
    fn apply_chunk(&mut self, chunk: ChatCompletionChunk) -> Result<(), Error> {
        if !chunk.id.is_empty()
            && self.id.get_or_insert_with(|| chunk.id.clone()) != &chunk.id
        {
            return Err(Error::new("chunk id mismatch", ErrorKind::Provider));
        }

        // With `include_usage`, the usage arrives in a trailing chunk that
        // has no choices.
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.pending_events
                        .push_back(ModelResponseEvent::MessageDelta(content));
                }
            }
            if let Some(tool_calls) = choice.delta.tool_calls {
                for tool_call in tool_calls {
                    self.merge_tool_call(tool_call);
                }
            }
            if let Some(finish_reason) = choice.finish_reason {
                self.finish_reason = Some(match finish_reason.as_str() {
                    "tool_calls" | "function_call" => {
                        ModelFinishReason::ToolCalls
                    }
                    "length" => ModelFinishReason::Length,
                    _ => ModelFinishReason::Stop,
                });
            }
        }
        Ok(())
    }

    fn merge_tool_call(&mut self, tool_call: ToolCall) {
        let partial_tool_call = match tool_call.index {
            Some(index) => self
                .tool_calls
                .iter_mut()
                .find(|t| t.index == Some(index)),
            // Without an index, a delta carrying an id starts a new call and
            // anything else continues the last one.
            None if tool_call.id.is_some() => None,
            None => self.tool_calls.last_mut(),
        };
        let Some(partial_tool_call) = partial_tool_call else {
            self.tool_calls.push(tool_call);
            return;
        };

        // Patch the partial tool call.
        if let Some(id) = tool_call.id {
            // Ids are not split across deltas, a repeated id is a resend.
            if partial_tool_call.id.as_deref() != Some(id.as_str()) {
                partial_tool_call.id.get_or_insert_default().push_str(&id);
            }
        }
        if let Some(ty) = tool_call.r#type {
            partial_tool_call.r#type.get_or_insert(ty);
        }
        if let Some(function) = tool_call.function {
            match partial_tool_call.function {
                Some(ref mut partial_func) => {
                    if let Some(name) = function.name {
                        partial_func
                            .name
                            .get_or_insert_default()
                            .push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        partial_func
                            .arguments
                            .get_or_insert_default()
                            .push_str(&arguments);
                    }
                }
                None => partial_tool_call.function = Some(function),
            }
        }
    }

    /// Queues the trailing events. `saw_done` tells whether the stream was
    /// terminated by the `[DONE]` sentinel rather than just closed.
    fn finish(&mut self, saw_done: bool) -> Result<(), Error> {
        self.done = true;
        let has_tool_calls = !self.tool_calls.is_empty();
        let finish_reason = match self.finish_reason {
            // Some providers report `stop` even when they call tools.
            Some(_) if has_tool_calls => ModelFinishReason::ToolCalls,
            Some(reason) => reason,
            None if !saw_done => {
                return Err(Error::new(
                    "stream ended before the response completed",
                    ErrorKind::Network,
                ));
            }
            None if has_tool_calls => ModelFinishReason::ToolCalls,
            None => ModelFinishReason::Stop,
        };

        for (idx, tool_call) in self.tool_calls.drain(..).enumerate() {
            self.pending_events
                .push_back(ModelResponseEvent::ToolCall(into_request(
                    idx, tool_call,
                )));
        }
        if let Some(usage) = self.usage {
            self.pending_events.push_back(ModelResponseEvent::Usage(usage));
        }
        self.pending_events
            .push_back(ModelResponseEvent::Completed(finish_reason));
        Ok(())
    }
}

fn into_request(idx: usize, tool_call: ToolCall) -> ToolCallRequest {
    let id = tool_call
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("call_{idx}"));
    let function = tool_call.function.unwrap_or_default();
    let raw_arguments = function.arguments.unwrap_or_default();
    let arguments = if raw_arguments.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str::<Value>(&raw_arguments)
            .unwrap_or(Value::String(raw_arguments))
    };
    ToolCallRequest {
        id,
        name: function.name.unwrap_or_default(),
        arguments,
    }
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    /// A streaming response from an OpenAI-compatible endpoint.
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl std::fmt::Debug for OpenAIResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIResponse").finish_non_exhaustive()
    }
}

impl OpenAIResponse {
    #[inline]
    pub(crate) fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            id: None,
            tool_calls: Default::default(),
            finish_reason: None,
            usage: None,
            pending_events: Default::default(),
            done: false,
        };
        let next_event_fut = async move { next_event(partial_state).await };
        Self {
            next_event_fut: Some(Box::pin(next_event_fut)),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        let next_event_fut = async move { next_event(partial_state).await };
        *this.next_event_fut = Some(Box::pin(next_event_fut));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(
    mut partial_state: PartialState,
) -> Result<(Option<ModelResponseEvent>, PartialState), Error> {
    loop {
        if let Some(event) = partial_state.pending_events.pop_front() {
            return Ok((Some(event), partial_state));
        }
        if partial_state.done {
            return Ok((None, partial_state));
        }

        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                partial_state.finish(false)?;
                continue;
            }
            Err(err) => {
                return Err(Error::new(
                    format!("stream interrupted: {err:?}"),
                    ErrorKind::Network,
                ));
            }
        };
        trace!("got sse event: {sse_event}");
        if sse_event.trim() == "[DONE]" {
            partial_state.finish(true)?;
            continue;
        }

        let chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event)
            .map_err(|err| {
                Error::new(
                    format!("malformed chunk: {err}"),
                    ErrorKind::Provider,
                )
            })?;
        partial_state.apply_chunk(chunk)?;
    }
}
