use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use supercli_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent, RateLimits, TokenUsage,
    ToolCallRequest,
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::ModelError;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, RetryState};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

type BoxError = Box<dyn ModelProviderError>;
type BoxResponse = Pin<Box<dyn DynResponse>>;

trait DynResponse: Send {
    fn poll_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, BoxError>>;
}

impl<R: ModelResponse> DynResponse for R {
    #[inline]
    fn poll_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, BoxError>> {
        self.poll_next_event(cx)
            .map_err(|err| Box::new(err) as BoxError)
    }
}

trait DynProvider: Send + Sync {
    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> BoxFuture<'static, Result<BoxResponse, BoxError>>;

    fn authenticate(&self) -> BoxFuture<'static, Result<(), BoxError>>;

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<String>, BoxError>>;
}

impl<P: ModelProvider + 'static> DynProvider for P {
    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> BoxFuture<'static, Result<BoxResponse, BoxError>> {
        let fut = ModelProvider::send_request(self, req);
        Box::pin(async move {
            match fut.await {
                Ok(resp) => Ok(Box::pin(resp) as BoxResponse),
                Err(err) => Err(Box::new(err) as BoxError),
            }
        })
    }

    fn authenticate(&self) -> BoxFuture<'static, Result<(), BoxError>> {
        let fut = ModelProvider::authenticate(self);
        Box::pin(async move {
            fut.await.map_err(|err| Box::new(err) as BoxError)
        })
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<String>, BoxError>> {
        let fut = ModelProvider::list_models(self);
        Box::pin(async move {
            fut.await.map_err(|err| Box::new(err) as BoxError)
        })
    }
}

/// A wrapper around a model provider that maintains an execution
/// environment for the provider and provides a type-erased interface
/// for the other modules.
///
/// On top of the provider it retries transient failures, applies the
/// client-side rate limits, enforces an idle timeout on the stream and
/// observes cancellation.
#[derive(Clone)]
pub struct ModelClient {
    // We have to erase the type `P`, since `ModelClient` doesn't have a
    // generic parameter and we don't want it either.
    provider: Arc<dyn DynProvider>,
    retry: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    idle_timeout: Duration,
}

/// A completely received response from the model client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelClientResponse {
    /// All text deltas joined.
    pub transcript: String,
    /// Tool calls requested by the model, deduplicated by id.
    pub tool_calls: Vec<ToolCallRequest>,
    /// The reason the model finished generating.
    pub finish_reason: ModelFinishReason,
    /// Token usage, if the provider reported it.
    pub usage: Option<TokenUsage>,
}

impl ModelClientResponse {
    fn cancelled() -> Self {
        Self {
            transcript: String::new(),
            tool_calls: vec![],
            finish_reason: ModelFinishReason::Cancelled,
            usage: None,
        }
    }
}

impl ModelClient {
    /// Wraps `provider` with the default retry policy and no rate limits.
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            retry: RetryPolicy::default(),
            limiter: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Replaces the retry policy.
    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Applies client-side request limits.
    #[inline]
    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.limiter = RateLimiter::new(limits).map(Arc::new);
        self
    }

    /// Sets how long the stream may stay silent before it is abandoned.
    #[inline]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Makes sure the provider is ready, obtaining credentials if needed.
    pub async fn authenticate(&self) -> Result<(), ModelError> {
        self.provider
            .authenticate()
            .await
            .map_err(|err| ModelError::from_provider(err.as_ref()))
    }

    /// Lists the models offered by the provider.
    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        self.provider
            .list_models()
            .await
            .map_err(|err| ModelError::from_provider(err.as_ref()))
    }

    /// Sends a request and returns the response.
    ///
    /// Rate limit and network failures are retried with backoff as long as
    /// no event has been received. Once the stream has started, an error is
    /// returned as is.
    ///
    /// When `cancel` fires, the stream is dropped and the text received so
    /// far is returned with [`ModelFinishReason::Cancelled`].
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    pub async fn send_request(
        &self,
        req: ModelRequest,
        on_transcript: &(dyn Fn(&str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<ModelClientResponse, ModelError> {
        let mut retry = RetryState::new(&self.retry);
        loop {
            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Ok(ModelClientResponse::cancelled());
                    }
                    res = limiter.acquire() => {
                        if let Err(err) = res {
                            return Err(ModelError::new(
                                ErrorKind::RateLimitExceeded,
                                format!(
                                    "daily request limit reached, \
                                     resets in {}s",
                                    err.resets_in.as_secs()
                                ),
                            ));
                        }
                    }
                }
            }

            trace!("sending a request: {:?}", req);
            let attempt = async {
                let resp = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Ok(ModelClientResponse::cancelled());
                    }
                    res = self.provider.send_request(&req) => res?,
                };
                consume(resp, on_transcript, cancel, self.idle_timeout).await
            }
            .instrument(trace_span!("model client req"));

            let err = match attempt.await {
                Ok(resp) => return Ok(resp),
                Err(StreamFailure::Started(err)) => return Err(err),
                Err(StreamFailure::BeforeFirstEvent(err)) => err,
            };

            let Some(delay) = retry.next_delay(err.kind()) else {
                error!("request failed: {err}");
                return Err(err);
            };
            warn!("request failed ({err}), retrying in {delay:?}");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(ModelClientResponse::cancelled());
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

enum StreamFailure {
    BeforeFirstEvent(ModelError),
    Started(ModelError),
}

impl From<BoxError> for StreamFailure {
    #[inline]
    fn from(err: BoxError) -> Self {
        StreamFailure::BeforeFirstEvent(ModelError::from_provider(err.as_ref()))
    }
}

async fn consume(
    mut resp: BoxResponse,
    on_transcript: &(dyn Fn(&str) + Send + Sync),
    cancel: &CancellationToken,
    idle_timeout: Duration,
) -> Result<ModelClientResponse, StreamFailure> {
    let mut transcript = String::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
    let mut finish_reason = None;
    let mut usage = None;
    let mut started = false;

    trace!("start receiving events");

    loop {
        let next = poll_fn(|cx| resp.as_mut().poll_event(cx));
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = timeout(idle_timeout, next) => Some(res),
        };
        let Some(polled) = polled else {
            debug!("response cancelled");
            finish_reason = Some(ModelFinishReason::Cancelled);
            break;
        };
        let Ok(event_or_err) = polled else {
            let err = ModelError::new(
                ErrorKind::Network,
                format!("no data received for {}s", idle_timeout.as_secs()),
            );
            return Err(fail(started, err));
        };

        let event = match event_or_err {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) => {
                let err = ModelError::from_provider(err.as_ref());
                error!("got an error: {err}");
                return Err(fail(started, err));
            }
        };
        trace!("got an event: {event:?}");
        started = true;

        match event {
            ModelResponseEvent::MessageDelta(msg) => {
                on_transcript(&msg);
                transcript.push_str(&msg);
            }
            ModelResponseEvent::ToolCall(req) => {
                // A repeated id replaces the earlier call in place.
                match tool_calls.iter_mut().find(|call| call.id == req.id) {
                    Some(existing) => *existing = req,
                    None => tool_calls.push(req),
                }
            }
            ModelResponseEvent::Usage(reported) => usage = Some(reported),
            ModelResponseEvent::Completed(reason) => {
                finish_reason = Some(reason);
            }
        }
    }

    trace!("finished a request");

    let finish_reason = finish_reason.unwrap_or(if tool_calls.is_empty() {
        ModelFinishReason::Stop
    } else {
        ModelFinishReason::ToolCalls
    });
    Ok(ModelClientResponse {
        transcript,
        tool_calls,
        finish_reason,
        usage,
    })
}

fn fail(started: bool, err: ModelError) -> StreamFailure {
    if started {
        StreamFailure::Started(err)
    } else {
        StreamFailure::BeforeFirstEvent(err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use supercli_model::ModelMessage;
    use supercli_test_model::{
        PresetEvent, PresetResponse, TestModelProvider,
    };

    use super::*;

    fn hi() -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::User("Hi".to_owned())],
            ..Default::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut model_provider = TestModelProvider::default();
        model_provider.add_assistant_response_step(
            PresetResponse::with_events([
                PresetEvent::MessageDelta("How ".to_owned()),
                PresetEvent::MessageDelta("are ".to_owned()),
                PresetEvent::MessageDelta("you?".to_owned()),
                PresetEvent::Usage(TokenUsage {
                    prompt_tokens: 5,
                    completion_tokens: 3,
                }),
            ]),
        );

        let model_client = ModelClient::new(model_provider);
        let on_transcript_called = AtomicBool::new(false);
        let resp = model_client
            .send_request(
                hi(),
                &|_| on_transcript_called.store(true, Ordering::Relaxed),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.transcript, "How are you?");
        assert_eq!(resp.finish_reason, ModelFinishReason::Stop);
        assert_eq!(resp.usage.map(|u| u.total()), Some(8));
        assert!(on_transcript_called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_error_handling() {
        let model_provider = TestModelProvider::default();
        let model_client = ModelClient::new(model_provider);
        let err = model_client
            .send_request(hi(), &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limit_then_succeeds() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(
            PresetResponse::with_text("finally").with_failures(3),
        );
        let client = ModelClient::new(provider.clone())
            .with_retry_policy(fast_retry());
        let resp = client
            .send_request(hi(), &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.transcript, "finally");
        assert_eq!(provider.request_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(
            PresetResponse::with_text("never").with_failures(0),
        );
        let client = ModelClient::new(provider.clone())
            .with_retry_policy(fast_retry());
        let err = client
            .send_request(hi(), &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(provider.request_count(), 5);
    }

    #[tokio::test]
    async fn test_non_transient_errors_surface_immediately() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(
            PresetResponse::with_text("never")
                .with_failures(0)
                .with_failure_kind(ErrorKind::Provider),
        );
        let client = ModelClient::new(provider.clone());
        let err = client
            .send_request(hi(), &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_failure_is_not_retried() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::MessageDelta("partial".to_owned()),
            PresetEvent::StreamError,
        ]));
        let client =
            ModelClient::new(provider.clone()).with_retry_policy(fast_retry());
        let err = client
            .send_request(hi(), &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::MessageDelta("hello".to_owned()),
            PresetEvent::Hang,
        ]));
        let client = ModelClient::new(provider)
            .with_idle_timeout(Duration::from_secs(5));
        let err = client
            .send_request(hi(), &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_partial_text() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::MessageDelta("Once upon ".to_owned()),
            PresetEvent::Hang,
        ]));
        let client = ModelClient::new(provider);
        let cancel = CancellationToken::new();
        let seen = Mutex::new(String::new());
        let resp = client
            .send_request(
                hi(),
                &|delta| {
                    seen.lock().unwrap().push_str(delta);
                    cancel.cancel();
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(resp.finish_reason, ModelFinishReason::Cancelled);
        assert_eq!(resp.transcript, "Once upon ");
        assert_eq!(*seen.lock().unwrap(), "Once upon ");
    }

    #[tokio::test]
    async fn test_repeated_tool_call_id_replaces_earlier() {
        let call = |args: &str| ToolCallRequest {
            id: "call_0".to_owned(),
            name: "read_file".to_owned(),
            arguments: serde_json::json!({ "path": args }),
        };
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::ToolCall(call("a.txt")),
            PresetEvent::ToolCall(call("b.txt")),
        ]));
        let resp = ModelClient::new(provider)
            .send_request(hi(), &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.finish_reason, ModelFinishReason::ToolCalls);
        assert_eq!(resp.tool_calls, vec![call("b.txt")]);
    }
}
