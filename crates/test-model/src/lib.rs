//! A local fake model for testing purpose.

mod preset;

use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use supercli_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest, ModelResponse,
    ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub fn message(&self) -> &'static str {
        self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    preset: PresetResponse,
    event_idx: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        // SAFETY: This type does not require to be pinned.
        let this = unsafe { self.get_unchecked_mut() };

        if let Some(sleep) = &mut this.sleep {
            let sleep = sleep.as_mut();
            ready!(sleep.poll(cx));
            this.sleep = None;

            let preset_events = &this.preset.events;
            if this.event_idx < preset_events.len() {
                let event = match &preset_events[this.event_idx] {
                    PresetEvent::MessageDelta(msg) => {
                        ModelResponseEvent::MessageDelta(msg.clone())
                    }
                    PresetEvent::ToolCall(req) => {
                        ModelResponseEvent::ToolCall(req.clone())
                    }
                    PresetEvent::Usage(usage) => {
                        ModelResponseEvent::Usage(*usage)
                    }
                    PresetEvent::StreamError => {
                        this.event_idx = usize::MAX;
                        return Poll::Ready(Err(Error {
                            message: "stream interrupted",
                            kind: ErrorKind::Network,
                        }));
                    }
                    // Never woken again, only a timeout or cancellation on
                    // the consumer side ends this.
                    PresetEvent::Hang => return Poll::Pending,
                };
                this.event_idx += 1;
                return Poll::Ready(Ok(Some(event)));
            } else if this.event_idx == preset_events.len() {
                this.event_idx += 1;
                return Poll::Ready(Ok(Some(ModelResponseEvent::Completed(
                    this.preset.derived_finish_reason(),
                ))));
            } else {
                // In case this method is called after completion.
                return Poll::Ready(Ok(None));
            }
        }
        this.sleep = Some(Box::pin(sleep(this.delay)));
        Pin::new(this).poll_next_event(cx)
    }
}

#[derive(Default)]
struct Script {
    responses: Vec<PresetResponse>,
    cursor: usize,
    failed_attempts: u64,
    requests: Vec<ModelRequest>,
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the conversation script, which
/// is how the model should respond to requests. Each request consumes the
/// next step of the script once its simulated failures are used up. If there
/// are no enough steps in the script, an error will be returned.
///
/// Clones share the script, so a test can keep a handle to inspect the
/// received requests after handing the provider to the engine.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    #[inline]
    pub fn add_assistant_response_step(&mut self, preset: PresetResponse) {
        self.lock().responses.push(preset);
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns the number of requests received so far, failed ones included.
    #[inline]
    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Returns the requests received so far.
    #[inline]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_response(
        &self,
        req: &ModelRequest,
    ) -> Result<PresetResponse, Error> {
        let mut script = self.lock();
        script.requests.push(req.clone());

        let Some(preset) = script.responses.get(script.cursor).cloned() else {
            return Err(Error {
                message: "no enough steps",
                kind: ErrorKind::Other,
            });
        };
        if let Some(failures) = preset.failures {
            if failures == 0 || script.failed_attempts < failures {
                script.failed_attempts += 1;
                return Err(Error {
                    message: "simulated failure",
                    kind: preset.failure_kind,
                });
            }
        }
        script.cursor += 1;
        script.failed_attempts = 0;
        Ok(preset)
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let delay = self.delay.unwrap_or(Duration::from_millis(1));
        let resp = self.next_response(req).map(|preset| TestModelResponse {
            preset,
            event_idx: 0,
            delay,
            sleep: None,
        });
        ready(resp)
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use supercli_model::{
        ModelFinishReason, ModelMessage, ModelRequest, ModelTool,
        ToolCallRequest,
    };
    use serde_json::json;

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> (String, Option<ToolCallRequest>, ModelFinishReason) {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut tool_call = None;
        loop {
            let event = poll_fn(|cx| resp.as_mut().poll_next_event(cx))
                .await
                .unwrap()
                .unwrap();
            match event {
                ModelResponseEvent::Completed(reason) => {
                    return (msg, tool_call, reason);
                }
                ModelResponseEvent::MessageDelta(delta) => {
                    msg.push_str(&delta);
                }
                ModelResponseEvent::ToolCall(req) => tool_call = Some(req),
                ModelResponseEvent::Usage(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::MessageDelta("Hello, ".to_owned()),
            PresetEvent::MessageDelta("world!".to_owned()),
        ]));
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::MessageDelta("Sure, ".to_owned()),
            PresetEvent::MessageDelta("let me take a ".to_owned()),
            PresetEvent::MessageDelta("look.".to_owned()),
            PresetEvent::ToolCall(ToolCallRequest {
                id: "tool:1".to_owned(),
                name: "read_file".to_owned(),
                arguments: json!({ "path": "todo.txt" }),
            }),
        ]));

        let mut req = ModelRequest {
            model: None,
            messages: vec![ModelMessage::User("Hi".to_owned())],
            tools: vec![ModelTool {
                name: "read_file".to_owned(),
                description: "Reads a file".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "The path of the file to read"
                        }
                    }
                }),
            }],
        };
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, _, reason) = collect_response(resp).await;
        assert_eq!(msg, "Hello, world!");
        assert_eq!(reason, ModelFinishReason::Stop);

        req.messages.push(ModelMessage::assistant_text(msg));
        req.messages
            .push(ModelMessage::User("Check my todo".to_owned()));
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, tool_call, reason) = collect_response(resp).await;
        assert_eq!(msg, "Sure, let me take a look.");
        assert_eq!(reason, ModelFinishReason::ToolCalls);
        let tool_call = tool_call.unwrap();
        assert_eq!(tool_call.name, "read_file");
        assert_eq!(tool_call.arguments, json!({ "path": "todo.txt" }));

        assert_eq!(provider.request_count(), 2);
        assert_eq!(provider.requests()[1].messages.len(), 3);
        assert!(provider.send_request(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(
            PresetResponse::with_text("ok")
                .with_failures(2)
                .with_failure_kind(ErrorKind::Network),
        );

        let req = ModelRequest::default();
        for _ in 0..2 {
            let err = provider.send_request(&req).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::Network);
        }
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, _, _) = collect_response(resp).await;
        assert_eq!(msg, "ok");
        assert_eq!(provider.request_count(), 3);
    }
}
